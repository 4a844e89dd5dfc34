//! Wallet subcommand implementations.
//!
//! Thin glue over [`RpcClient`]: each function talks to a running
//! node's authenticated RPC surface and prints for humans.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::PathBuf;

use cryptopuff_protocol::crypto::address::{Address, Version};
use cryptopuff_protocol::crypto::keys::{decode_private_key_pem, encode_private_key_pem, generate_key};
use cryptopuff_protocol::network::RpcClient;
use cryptopuff_protocol::transaction::Tx;

/// Generates a key locally, imports it into the node's wallet, and
/// prints the derived address.
pub async fn generate_key_cmd(
    client: &RpcClient,
    version: Version,
    bits: usize,
    seed: u64,
) -> Result<()> {
    let key = generate_key(bits, seed)?;
    let address = client.add_key(&key, version).await?;
    println!("{address}");
    Ok(())
}

/// Imports a PEM private key from a file (or stdin) and prints the
/// derived address.
pub async fn import_key(client: &RpcClient, file: Option<PathBuf>, version: Version) -> Result<()> {
    let pem = match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read key from stdin")?;
            buf
        }
    };

    let key = decode_private_key_pem(&pem)?;
    let address = client.add_key(&key, version).await?;
    println!("{address}");
    Ok(())
}

/// Prints the PEM private key the node holds for `address`.
pub async fn export_key(client: &RpcClient, address: &str) -> Result<()> {
    let address = Address::from_base64(address)?;
    let key = client.key(&address).await?;
    print!("{}", encode_private_key_pem(&key));
    Ok(())
}

/// Points the node's miner at `address`. Refuses addresses the node
/// has no key for, to keep a typo from burning every future reward.
pub async fn set_miner_address(client: &RpcClient, address: &str) -> Result<()> {
    let address = Address::from_base64(address)?;
    client
        .key(&address)
        .await
        .context("node holds no key for that address")?;
    client.set_miner_address(&address).await?;
    Ok(())
}

/// Prints the balance of every wallet address, plus the total.
pub async fn balance(client: &RpcClient) -> Result<()> {
    let addresses = client.addresses().await?;

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut total: i64 = 0;
    for state in &addresses {
        rows.push(vec![state.address.to_string(), state.balance.to_string()]);
        total += state.balance;
    }
    rows.push(vec!["Total:".to_string(), total.to_string()]);

    print_table(&["Address", "Balance"], &rows);
    Ok(())
}

/// Prints every transaction touching a wallet address.
pub async fn txs(client: &RpcClient) -> Result<()> {
    let txs = client.my_txs().await?;

    let rows: Vec<Vec<String>> = txs
        .iter()
        .map(|ptx| {
            let height = if ptx.included {
                ptx.height.to_string()
            } else {
                "Pending".to_string()
            };
            vec![
                ptx.tx.source.to_string(),
                ptx.tx.destination.to_string(),
                ptx.tx.amount.to_string(),
                ptx.tx.fee.to_string(),
                height,
            ]
        })
        .collect();

    print_table(
        &["Source", "Destination", "Amount", "Fee", "Included at block height"],
        &rows,
    );
    Ok(())
}

/// Signs and broadcasts a transfer.
pub async fn send(
    client: &RpcClient,
    source: &str,
    destination: &str,
    amount: i64,
    fee: i64,
) -> Result<()> {
    let tx = Tx {
        destination: Address::from_base64(destination)?,
        amount,
        source: Address::from_base64(source)?,
        fee,
    };

    let stx = client.sign_tx(&tx).await?;
    client.broadcast_tx(&stx).await?;
    Ok(())
}

/// Prints the node's peer set.
pub async fn peers(client: &RpcClient) -> Result<()> {
    for peer in client.peers().await? {
        println!("{peer}");
    }
    Ok(())
}

/// Pads each column to its widest cell, separated by two spaces.
fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let print_row = |cells: &[&str]| {
        let line = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<w$}", w = *width))
            .collect::<Vec<_>>()
            .join("  ");
        println!("{}", line.trim_end());
    };

    print_row(headers);
    let dividers: Vec<&str> = headers.iter().map(|_| "--------").collect();
    print_row(&dividers);
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        print_row(&cells);
    }
}
