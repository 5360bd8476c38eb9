//! Protocol-neutral status codes and the [`Status`] error value.
//!
//! Every call ends with exactly one neutral [`Code`]; each protocol adapter
//! renders it into its own wire representation (binary trailers, an HTTP
//! status for transcoding, or a JSON-RPC error object).

use std::str::FromStr;

use serde::{Serialize, Serializer};

/// Neutral RPC status codes, matching the canonical gRPC code set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Get the string representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }

    /// Numeric value carried in binary-protocol trailers.
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// HTTP status used by the transcoding surface for this code.
    pub fn http_status(&self) -> u16 {
        match self {
            Code::Ok => 200,
            Code::InvalidArgument | Code::OutOfRange | Code::FailedPrecondition => 400,
            Code::Unauthenticated => 401,
            Code::PermissionDenied => 403,
            Code::NotFound => 404,
            Code::AlreadyExists | Code::Aborted => 409,
            Code::ResourceExhausted => 429,
            Code::Cancelled => 499,
            Code::Unimplemented => 501,
            Code::Unavailable => 503,
            Code::DeadlineExceeded => 504,
            Code::Unknown | Code::Internal | Code::DataLoss => 500,
        }
    }
}

/// Error returned when parsing a [`Code`] from a string fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseCodeError(());

impl std::fmt::Display for ParseCodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown status code")
    }
}

impl std::error::Error for ParseCodeError {}

impl FromStr for Code {
    type Err = ParseCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Code::Ok),
            "cancelled" | "canceled" => Ok(Code::Cancelled),
            "unknown" => Ok(Code::Unknown),
            "invalid_argument" => Ok(Code::InvalidArgument),
            "deadline_exceeded" => Ok(Code::DeadlineExceeded),
            "not_found" => Ok(Code::NotFound),
            "already_exists" => Ok(Code::AlreadyExists),
            "permission_denied" => Ok(Code::PermissionDenied),
            "resource_exhausted" => Ok(Code::ResourceExhausted),
            "failed_precondition" => Ok(Code::FailedPrecondition),
            "aborted" => Ok(Code::Aborted),
            "out_of_range" => Ok(Code::OutOfRange),
            "unimplemented" => Ok(Code::Unimplemented),
            "internal" => Ok(Code::Internal),
            "unavailable" => Ok(Code::Unavailable),
            "data_loss" => Ok(Code::DataLoss),
            "unauthenticated" => Ok(Code::Unauthenticated),
            _ => Err(ParseCodeError(())),
        }
    }
}

/// JSON body for transcoding error responses.
#[derive(Serialize)]
struct ErrorResponseBody {
    code: Code,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// The result of an RPC call: a neutral code plus an optional message.
///
/// Handlers return `Result<_, Status>`; the owning protocol adapter renders
/// the final status onto the wire.
///
/// # Example
///
/// ```
/// use omnirpc_axum_core::{Code, Status};
///
/// let status = Status::not_found("shelf not found");
/// assert_eq!(status.code(), Code::NotFound);
/// assert_eq!(status.message(), Some("shelf not found"));
/// ```
#[derive(Clone, Debug)]
pub struct Status {
    code: Code,
    message: Option<String>,
}

impl Status {
    /// Create a new status with a code and message.
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Create a new status with just a code.
    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// The OK status.
    pub fn ok() -> Self {
        Self::from_code(Code::Ok)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    // Convenience constructors for the common error codes.

    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded<S: Into<String>>(message: S) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn already_exists<S: Into<String>>(message: S) -> Self {
        Self::new(Code::AlreadyExists, message)
    }

    pub fn permission_denied<S: Into<String>>(message: S) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn resource_exhausted<S: Into<String>>(message: S) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn failed_precondition<S: Into<String>>(message: S) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn aborted<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Aborted, message)
    }

    pub fn out_of_range<S: Into<String>>(message: S) -> Self {
        Self::new(Code::OutOfRange, message)
    }

    pub fn unimplemented<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn data_loss<S: Into<String>>(message: S) -> Self {
        Self::new(Code::DataLoss, message)
    }

    pub fn unauthenticated<S: Into<String>>(message: S) -> Self {
        Self::new(Code::Unauthenticated, message)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code.as_str())?;
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

impl Serialize for Status {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        ErrorResponseBody {
            code: self.code,
            message: self.message.clone(),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_as_str() {
        assert_eq!(Code::Ok.as_str(), "ok");
        assert_eq!(Code::InvalidArgument.as_str(), "invalid_argument");
        assert_eq!(Code::Unauthenticated.as_str(), "unauthenticated");
    }

    #[test]
    fn test_code_from_str() {
        assert_eq!("ok".parse(), Ok(Code::Ok));
        assert_eq!("cancelled".parse(), Ok(Code::Cancelled));
        assert_eq!("canceled".parse(), Ok(Code::Cancelled));
        assert_eq!("not_found".parse(), Ok(Code::NotFound));
        assert_eq!("nope".parse::<Code>(), Err(ParseCodeError(())));
    }

    #[test]
    fn test_code_http_status() {
        assert_eq!(Code::Ok.http_status(), 200);
        assert_eq!(Code::InvalidArgument.http_status(), 400);
        assert_eq!(Code::NotFound.http_status(), 404);
        assert_eq!(Code::ResourceExhausted.http_status(), 429);
        assert_eq!(Code::Unimplemented.http_status(), 501);
        assert_eq!(Code::DeadlineExceeded.http_status(), 504);
        assert_eq!(Code::Internal.http_status(), 500);
    }

    #[test]
    fn test_status_display() {
        let status = Status::not_found("shelf missing");
        assert_eq!(status.to_string(), "not_found: shelf missing");

        let status = Status::from_code(Code::Internal);
        assert_eq!(status.to_string(), "internal");
    }

    #[test]
    fn test_status_serialize() {
        let status = Status::invalid_argument("bad request");
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["code"], "invalid_argument");
        assert_eq!(json["message"], "bad request");
    }
}
