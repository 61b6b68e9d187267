//! Negative status codes carried in error responses.
//!
//! Codes -100 through -199 are raised locally by a client, codes -200
//! through -299 are sent by a server. Applications are free to use any
//! other negative value for their own errors.

/// First code of the SMFP numberspace.
pub const BEGIN_NUMBERSPACE: i32 = -100;
/// Last code of the SMFP numberspace.
pub const END_NUMBERSPACE: i32 = -299;

/// The client could not reach the server, or lost the connection mid-transaction.
pub const CONNECTION_FAILED: i32 = -100;

/// The server has no handler for the request code.
pub const UNKNOWN_REQUEST_CODE: i32 = -200;

/// Returns true if `code` lies inside the SMFP numberspace.
pub fn is_smfp_error(code: i32) -> bool {
    (END_NUMBERSPACE..=BEGIN_NUMBERSPACE).contains(&code)
}

/// Returns true for codes a client raises without hearing from the server.
pub fn is_local(code: i32) -> bool {
    (-199..=-100).contains(&code)
}

/// Returns true for codes a server sends back.
pub fn is_remote(code: i32) -> bool {
    (-299..=-200).contains(&code)
}

/// Returns a human-readable name for a status code.
pub fn error_name(code: i32) -> &'static str {
    match code {
        0 => "NO_ERROR",
        CONNECTION_FAILED => "CONNECTION_FAILED",
        UNKNOWN_REQUEST_CODE => "UNKNOWN_REQUEST_CODE",
        c if is_local(c) => "LOCAL",
        c if is_remote(c) => "REMOTE",
        _ => "unknown",
    }
}
