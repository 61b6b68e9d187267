use std::fs;

use smfp_frame::ResponseBody;
use smfp_peer::{Client, ClientConfig};
use smfp_transport::ConnectRetry;

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{io_error, peer_error, CliResult, REMOTE_ERROR, SUCCESS};
use crate::output::{print_response, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let config = ClientConfig {
        connect_retry: ConnectRetry {
            retries: args.retries,
            ..ConnectRetry::default()
        },
        response_timeout: Some(timeout),
        ..ClientConfig::default()
    };
    let client = Client::connect_with_config(&args.path, config)
        .map_err(|err| peer_error("connect failed", err))?;

    let arg = resolve_arg(&args)?;
    let pending = client
        .send_request(args.code, &arg)
        .map_err(|err| peer_error("send failed", err))?;
    let body = pending
        .next_response()
        .map_err(|err| peer_error("receive failed", err))?;

    print_response(pending.transaction_id(), &body, format);
    match body {
        ResponseBody::Data(_) => Ok(SUCCESS),
        ResponseBody::Error(_) => Ok(REMOTE_ERROR),
    }
}

fn resolve_arg(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}
