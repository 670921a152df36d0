//! Label taxonomy shared by every series
//!
//! All series are keyed by `(grpc_type, grpc_service, grpc_method)`, with
//! `grpc_code` appended for the handled counters. Every value is derived from
//! static call information, so cardinality is bounded by the number of
//! registered methods times the number of status codes.

use tonic::Code;

pub const LABEL_TYPE: &str = "grpc_type";
pub const LABEL_SERVICE: &str = "grpc_service";
pub const LABEL_METHOD: &str = "grpc_method";
pub const LABEL_CODE: &str = "grpc_code";

/// Label names for series keyed without a status code
pub const CALL_LABELS: [&str; 3] = [LABEL_TYPE, LABEL_SERVICE, LABEL_METHOD];

/// Label names for the handled counters
pub const CALL_CODE_LABELS: [&str; 4] = [LABEL_TYPE, LABEL_SERVICE, LABEL_METHOD, LABEL_CODE];

/// Every status code a call can terminate with, in wire order
pub const ALL_CODES: [Code; 17] = [
    Code::Ok,
    Code::Cancelled,
    Code::Unknown,
    Code::InvalidArgument,
    Code::DeadlineExceeded,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::ResourceExhausted,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unimplemented,
    Code::Internal,
    Code::Unavailable,
    Code::DataLoss,
    Code::Unauthenticated,
];

/// Shape of a call, derived from its client/server streaming flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrpcType {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

impl GrpcType {
    pub fn from_streaming(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => GrpcType::Unary,
            (true, false) => GrpcType::ClientStream,
            (false, true) => GrpcType::ServerStream,
            (true, true) => GrpcType::BidiStream,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GrpcType::Unary => "unary",
            GrpcType::ClientStream => "client_stream",
            GrpcType::ServerStream => "server_stream",
            GrpcType::BidiStream => "bidi_stream",
        }
    }
}

impl std::fmt::Display for GrpcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical label value for a status code
///
/// These are the names used by the gRPC status code registry (`OK`,
/// `Canceled`, `NotFound`, ...), which differ from `Code`'s `Debug` output.
pub fn code_label(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Canceled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

/// Split `/package.Service/Method` into `("package.Service", "Method")`
///
/// Names without a separator map to `("unknown", "unknown")`.
pub fn split_method_name(full_method: &str) -> (&str, &str) {
    let trimmed = full_method.strip_prefix('/').unwrap_or(full_method);
    match trimmed.split_once('/') {
        Some((service, method)) => (service, method),
        None => ("unknown", "unknown"),
    }
}

/// Static description of the call being intercepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Full method path, e.g. `/helloworld.Greeter/SayHello`
    pub full_method: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl MethodDescriptor {
    pub fn new(full_method: impl Into<String>, client_streaming: bool, server_streaming: bool) -> Self {
        Self {
            full_method: full_method.into(),
            client_streaming,
            server_streaming,
        }
    }

    pub fn unary(full_method: impl Into<String>) -> Self {
        Self::new(full_method, false, false)
    }

    pub fn client_streaming(full_method: impl Into<String>) -> Self {
        Self::new(full_method, true, false)
    }

    pub fn server_streaming(full_method: impl Into<String>) -> Self {
        Self::new(full_method, false, true)
    }

    pub fn bidi_streaming(full_method: impl Into<String>) -> Self {
        Self::new(full_method, true, true)
    }

    pub fn grpc_type(&self) -> GrpcType {
        GrpcType::from_streaming(self.client_streaming, self.server_streaming)
    }

    pub fn labels(&self) -> CallLabels {
        let (service, method) = split_method_name(&self.full_method);
        CallLabels::new(self.grpc_type(), service, method)
    }
}

/// Resolved `(grpc_type, grpc_service, grpc_method)` tuple for one call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallLabels {
    pub grpc_type: GrpcType,
    pub service: String,
    pub method: String,
}

impl CallLabels {
    pub fn new(grpc_type: GrpcType, service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            grpc_type,
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn values(&self) -> [&str; 3] {
        [self.grpc_type.as_str(), &self.service, &self.method]
    }

    pub fn values_with_code(&self, code: Code) -> [&str; 4] {
        [
            self.grpc_type.as_str(),
            &self.service,
            &self.method,
            code_label(code),
        ]
    }
}
