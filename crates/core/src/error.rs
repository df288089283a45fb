//! The discovery error taxonomy, shaped for transport over RPC: every error
//! maps to a gRPC-style status code at the server boundary.

use thiserror::Error;

use crate::meta::ServiceId;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Bad authority: unparsable host or port, an IP literal, or an
    /// ExternalName service.
    #[error("invalid authority: {0}")]
    InvalidAuthority(String),

    #[error("service {0} not found")]
    ServiceNotFound(ServiceId),

    #[error("cluster {0:?} not found")]
    ClusterNotFound(String),

    /// A remote-discovery service missing its required labels.
    #[error("remote discovery service misconfigured: {0}")]
    MisconfiguredRemote(String),

    /// The requested service/port combination cannot back a topic.
    #[error("invalid service {0}: {1}")]
    InvalidService(ServiceId, String),

    #[error("topic is closed")]
    TopicClosed,

    #[error("dispatcher is closed")]
    DispatcherClosed,

    #[error("internal: {0}")]
    Internal(String),
}

/// Status codes understood by the RPC scaffolding wrapping this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Internal,
}

impl DiscoveryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DiscoveryError::InvalidAuthority(_) | DiscoveryError::InvalidService(_, _) => {
                ErrorCode::InvalidArgument
            }
            DiscoveryError::ServiceNotFound(_) | DiscoveryError::ClusterNotFound(_) => {
                ErrorCode::NotFound
            }
            DiscoveryError::MisconfiguredRemote(_) => ErrorCode::FailedPrecondition,
            DiscoveryError::TopicClosed
            | DiscoveryError::DispatcherClosed
            | DiscoveryError::Internal(_) => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_the_taxonomy() {
        let id = ServiceId::new("ns", "name1");
        assert_eq!(DiscoveryError::InvalidAuthority("x".into()).code(), ErrorCode::InvalidArgument);
        assert_eq!(DiscoveryError::InvalidService(id.clone(), "port".into()).code(), ErrorCode::InvalidArgument);
        assert_eq!(DiscoveryError::ServiceNotFound(id).code(), ErrorCode::NotFound);
        assert_eq!(DiscoveryError::ClusterNotFound("east".into()).code(), ErrorCode::NotFound);
        assert_eq!(DiscoveryError::MisconfiguredRemote("label".into()).code(), ErrorCode::FailedPrecondition);
        assert_eq!(DiscoveryError::DispatcherClosed.code(), ErrorCode::Internal);
    }
}
