//! ObjectStore errors

use aws_sdk_s3::error::SdkError;
use http::StatusCode;
use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

/// General purpose [`super::ObjectStore`] error handling.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("http error")]
    HTTPError(#[from] http::Error),

    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("{0}")]
    ByteStreamError(#[from] aws_sdk_s3::primitives::ByteStreamError),

    #[error("aws sdk create multipart upload error")]
    AWSSDKCreateMultiPartUploadError(
        #[from]
        SdkError<aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError>,
    ),
    #[error("aws sdk upload part error")]
    AWSSDKUploadPartError(#[from] SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>),
    #[error("aws sdk complete multipart upload error")]
    AWSSDKCompleteMultipartUploadError(
        #[from]
        SdkError<aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError>,
    ),
    #[error("aws sdk abort multipart upload error")]
    AWSSDKAbortMultipartUploadError(
        #[from] SdkError<aws_sdk_s3::operation::abort_multipart_upload::AbortMultipartUploadError>,
    ),
    #[error("aws sdk presign get object error")]
    AWSSDKGetObjectError(#[from] SdkError<aws_sdk_s3::operation::get_object::GetObjectError>),
    #[error("aws sdk presigning config error")]
    AWSSDKPresigningConfigError(#[from] aws_sdk_s3::presigning::PresigningConfigError),
    #[error("aws sdk credentials error")]
    AWSSDKCredentialsError(#[from] aws_credential_types::provider::error::CredentialsError),

    #[error("failed to initiate chunked upload: {0}")]
    ObjectsFailedToInitiateChunkedUpload(&'static str),

    #[error("no such upload: {0}")]
    UnknownUpload(String),
    #[error("invalid part {chunk_number}: {reason}")]
    InvalidPart {
        chunk_number: i32,
        reason: &'static str,
    },
    #[error("no such object: {0}")]
    UnknownObject(String),
    #[error("retrieval url not recognized: {0}")]
    UnknownUrl(String),
    #[error("retrieval url expired")]
    UrlExpired,
    #[error("backend temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("key error: {0}")]
    KeyError(#[from] KeyError),
}

impl Error {
    /// Whether the failed call may succeed if repeated unchanged.
    ///
    /// Network-level failures, timeouts, throttling and 5xx responses are transient. Everything
    /// that indicates a malformed request, bad credentials, a missing upload or a local problem is
    /// not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::AWSSDKCreateMultiPartUploadError(e) => sdk_error_is_transient(e),
            Error::AWSSDKUploadPartError(e) => sdk_error_is_transient(e),
            Error::AWSSDKCompleteMultipartUploadError(e) => sdk_error_is_transient(e),
            Error::AWSSDKAbortMultipartUploadError(e) => sdk_error_is_transient(e),
            Error::AWSSDKGetObjectError(e) => sdk_error_is_transient(e),
            Error::Unavailable(_) => true,
            _ => false,
        }
    }
}

fn sdk_error_is_transient<E>(e: &SdkError<E>) -> bool {
    match e {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(e) => {
            let status = e.raw().status();
            status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
        }
        _ => false,
    }
}

/// Error type used when parsing [`super::Key`] from [`std::path::PathBuf`].
#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("empty keys not allowed")]
    Empty,

    #[error("prefix not allowed")]
    PrefixNotAllowed,

    #[error("root dir not allowed")]
    RootDirNotAllowed,

    #[error("current dir (`.`) not allowed")]
    CurDirNotAllowed,

    #[error("parent dir (`..`) not allowed")]
    ParentDirNotAllowed,

    #[error("path components must be valid unicode")]
    PathComponentsMustBeValidUnicode,

    #[error("path component {0:?} contains control characters")]
    ControlCharactersNotAllowed(String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn local_failures_are_not_transient() {
        let e = Error::IOError(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!e.is_transient());
        assert!(!Error::UnknownUpload("abc".into()).is_transient());
        assert!(!Error::KeyError(KeyError::Empty).is_transient());
    }

    #[test]
    fn unavailable_is_transient() {
        assert!(Error::Unavailable("maintenance".into()).is_transient());
    }
}
