use diesel::result::{DatabaseErrorKind, Error as DieselError};

use crate::chain_client::ChainClientErr;

use super::super::types::{FetchError, FetchErrorKind, PersistError};

pub fn map_diesel_error(error: DieselError) -> PersistError {
    match error {
        DieselError::DatabaseError(kind, info) => match kind {
            DatabaseErrorKind::SerializationFailure
            | DatabaseErrorKind::ClosedConnection
            | DatabaseErrorKind::UnableToSendCommand => PersistError::retryable(format!(
                "transient database error ({kind:?}): {}",
                info.message()
            )),
            _ => PersistError::fatal(format!(
                "fatal database error ({kind:?}): {}",
                info.message()
            )),
        },
        DieselError::RollbackTransaction => {
            PersistError::retryable("transaction rollback requested by database".to_string())
        }
        other => PersistError::fatal(format!("fatal diesel error: {other}")),
    }
}

pub fn map_chain_error(error: ChainClientErr) -> FetchError {
    match error {
        ChainClientErr::UnexpectedStatus { resource, status } => {
            map_status_to_fetch_error(resource, status)
        }
        ChainClientErr::RequestError(req_err) => {
            if let Some(status) = req_err.status() {
                return map_status_to_fetch_error("block".to_string(), status.as_u16());
            }

            if req_err.is_timeout()
                || req_err.is_connect()
                || req_err.is_request()
                || req_err.is_body()
            {
                return FetchError::new(
                    FetchErrorKind::Network,
                    format!("network/transport error while fetching block: {req_err}"),
                );
            }

            if req_err.is_decode() {
                return FetchError::new(
                    FetchErrorKind::Network,
                    format!("response decode error while fetching block (retryable): {req_err}"),
                );
            }

            FetchError::new(FetchErrorKind::MalformedResponse, format!("{req_err:#}"))
        }
        ChainClientErr::ParseError(message) => FetchError::new(
            FetchErrorKind::MalformedResponse,
            format!("unparseable block payload: {message}"),
        ),
        ChainClientErr::ConnectError(message) => FetchError::new(
            FetchErrorKind::Network,
            format!("connection error while fetching block: {message}"),
        ),
    }
}

fn map_status_to_fetch_error(resource: String, status: u16) -> FetchError {
    match status {
        401 => FetchError::new(
            FetchErrorKind::Unauthorized,
            format!("unauthorized while fetching {resource}"),
        ),
        403 => FetchError::new(
            FetchErrorKind::Forbidden,
            format!("forbidden while fetching {resource}"),
        ),
        429 => FetchError::new(
            FetchErrorKind::RateLimited,
            format!("rate limited while fetching {resource}"),
        ),
        400..=499 => FetchError::new(
            FetchErrorKind::Other,
            format!("upstream client error {status} while fetching {resource}"),
        ),
        500..=599 => FetchError::new(
            FetchErrorKind::UpstreamUnavailable,
            format!("upstream server error {status} while fetching {resource}"),
        ),
        _ => FetchError::new(
            FetchErrorKind::Other,
            format!("unexpected HTTP status {status} while fetching {resource}"),
        ),
    }
}
