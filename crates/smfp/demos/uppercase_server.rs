//! Uppercase server: code 0x42 answers with the uppercased argument, code
//! 0x43 streams it back one word per response. Anything else is answered
//! with UNKNOWN_REQUEST_CODE.
//!
//! Run with:
//!   cargo run --example uppercase-server
//!
//! In another terminal:
//!   cargo run --example uppercase-client -- "hello smfp"

use smfp::frame::UNKNOWN_REQUEST_CODE;
use smfp::peer::{Server, Transaction};

const SOCKET_PATH: &str = "/tmp/smfp-uppercase-example.sock";

fn handle(mut transaction: Transaction) {
    let text = String::from_utf8_lossy(transaction.arg()).to_uppercase();
    let result = match transaction.code() {
        0x42 => transaction.respond_str(&text, true),
        0x43 => {
            let mut result = Ok(());
            for word in text.split_whitespace() {
                result = result.and_then(|()| transaction.respond_str(word, false));
            }
            result.and_then(|()| transaction.respond(b"", true))
        }
        _ => transaction.respond_err(UNKNOWN_REQUEST_CODE),
    };
    if let Err(err) = result {
        eprintln!("respond failed: {err}");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| SOCKET_PATH.to_string());

    let server = Server::bind(&path, handle)?;
    eprintln!("Listening on {}", server.path().display());

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
