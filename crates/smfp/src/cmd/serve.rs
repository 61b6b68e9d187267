use smfp_frame::UNKNOWN_REQUEST_CODE;
use smfp_peer::{FramingErrorPolicy, RequestHandler, Server, ServerConfig, Transaction};
use tracing::{debug, warn};

use crate::cmd::ServeArgs;
use crate::exit::{io_error, peer_error, CliResult, SUCCESS};

/// Request code answered with the uppercased argument.
pub const UPPERCASE: u8 = 0x42;

/// Answers [`UPPERCASE`] requests; every other code gets
/// `UNKNOWN_REQUEST_CODE`.
pub struct UppercaseHandler;

impl RequestHandler for UppercaseHandler {
    fn handle(&self, mut transaction: Transaction) {
        debug!(
            connection_id = transaction.connection_id(),
            transaction_id = transaction.transaction_id(),
            code = transaction.code(),
            "request"
        );
        let result = match transaction.code() {
            UPPERCASE => {
                let output = String::from_utf8_lossy(transaction.arg()).to_uppercase();
                transaction.respond_str(&output, true)
            }
            _ => transaction.respond_err(UNKNOWN_REQUEST_CODE),
        };
        if let Err(err) = result {
            warn!(error = %err, "response failed");
        }
    }
}

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let config = ServerConfig {
        framing_error_policy: if args.close_on_framing_error {
            FramingErrorPolicy::CloseConnection
        } else {
            FramingErrorPolicy::DiscardBuffer
        },
        ..ServerConfig::default()
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime setup failed", err))?;

    runtime.block_on(async move {
        let server = Server::bind_with_config(&args.path, UppercaseHandler, config)
            .map_err(|err| peer_error("bind failed", err))?;
        server
            .run_until(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "signal handler setup failed");
                    std::future::pending::<()>().await;
                }
            })
            .await
            .map_err(|err| peer_error("server failed", err))
    })?;

    Ok(SUCCESS)
}
