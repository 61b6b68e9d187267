use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use smfp_frame::{error_name, ResponseBody};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ResponseOutput<'a> {
    transaction_id: u32,
    status: i32,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

pub fn print_response(transaction_id: u32, body: &ResponseBody, format: OutputFormat) {
    let status = status_of(body);
    match format {
        OutputFormat::Json => {
            let out = ResponseOutput {
                transaction_id,
                status,
                ok: status >= 0,
                error_name: error_code(body).map(error_name),
                payload: payload_of(body).map(payload_preview),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["TRANSACTION", "STATUS", "PAYLOAD"])
                .add_row(vec![
                    transaction_id.to_string(),
                    status_label(body),
                    payload_of(body).map(payload_preview).unwrap_or_default(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => match body {
            ResponseBody::Data(payload) => println!(
                "transaction={} size={} payload={}",
                transaction_id,
                payload.len(),
                payload_preview(payload)
            ),
            ResponseBody::Error(_) => println!(
                "transaction={} error={}",
                transaction_id,
                status_label(body)
            ),
        },
        OutputFormat::Raw => {
            if let ResponseBody::Data(payload) = body {
                print_raw(payload);
            }
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn status_of(body: &ResponseBody) -> i32 {
    match body {
        ResponseBody::Data(payload) => i32::try_from(payload.len()).unwrap_or(i32::MAX),
        ResponseBody::Error(code) => *code,
    }
}

fn status_label(body: &ResponseBody) -> String {
    match body {
        ResponseBody::Data(payload) => format!("ok ({} bytes)", payload.len()),
        ResponseBody::Error(code) => format!("{code} ({})", error_name(*code)),
    }
}

fn error_code(body: &ResponseBody) -> Option<i32> {
    match body {
        ResponseBody::Error(code) => Some(*code),
        ResponseBody::Data(_) => None,
    }
}

fn payload_of(body: &ResponseBody) -> Option<&[u8]> {
    match body {
        ResponseBody::Data(payload) => Some(payload.as_ref()),
        ResponseBody::Error(_) => None,
    }
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn status_labels() {
        let ok = ResponseBody::Data(Bytes::from_static(b"HELLO"));
        assert_eq!(status_of(&ok), 5);
        assert_eq!(status_label(&ok), "ok (5 bytes)");

        let err = ResponseBody::Error(-200);
        assert_eq!(status_of(&err), -200);
        assert_eq!(status_label(&err), "-200 (UNKNOWN_REQUEST_CODE)");
    }

    #[test]
    fn binary_payload_preview() {
        assert_eq!(payload_preview(&[0xff, 0xfe]), "<binary 2 bytes>");
        assert_eq!(payload_preview(b"text"), "text");
    }
}
