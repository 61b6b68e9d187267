//! Issues concurrent requests against the uppercase server and prints the
//! responses, including a streamed one and an error.
//!
//! Run with:
//!   cargo run --example uppercase-client -- "hello smfp"

use smfp::frame::ResponseBody;
use smfp::peer::Client;

const SOCKET_PATH: &str = "/tmp/smfp-uppercase-example.sock";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let text = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "hello smfp".to_string());

    // Waits up to ten seconds for the server to come up.
    let client = Client::connect(SOCKET_PATH)?;

    // Both requests are in flight at once.
    let whole = client.send_request(0x42, text.as_bytes())?;
    let words = client.send_request(0x43, text.as_bytes())?;

    if let ResponseBody::Data(payload) = whole.next_response()? {
        println!("uppercased: {}", String::from_utf8_lossy(&payload));
    }

    loop {
        match words.next_response()? {
            ResponseBody::Data(payload) if payload.is_empty() => break,
            ResponseBody::Data(payload) => println!("word: {}", String::from_utf8_lossy(&payload)),
            ResponseBody::Error(code) => {
                println!("error response: {code}");
                break;
            }
        }
    }

    match client.request(0x01, b"") {
        Ok(_) => println!("unexpected success for code 0x01"),
        Err(err) => println!("code 0x01: {err}"),
    }
    Ok(())
}
