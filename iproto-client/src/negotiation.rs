//! Protocol version and feature negotiation (`IPROTO_ID`).

use iproto_protocol::{FeatureSet, Greeting, IdResponse};
use uuid::Uuid;

/// What the client and server agreed on after connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Minimum of the client and server protocol versions.
    pub protocol_version: u64,
    /// Intersection of the client and server feature sets.
    pub features: FeatureSet,
    /// Authentication method advertised by the server.
    pub auth_type: Option<String>,
    /// Server version from the greeting.
    pub server_version: String,
    pub instance_uuid: Option<Uuid>,
}

impl ServerInfo {
    pub(crate) fn negotiate(
        greeting: &Greeting,
        client_version: u64,
        client_features: FeatureSet,
        reply: &IdResponse,
    ) -> Self {
        Self {
            protocol_version: client_version.min(reply.version),
            features: client_features.intersection(&reply.features),
            auth_type: reply.auth_type.clone(),
            server_version: greeting.version.clone(),
            instance_uuid: greeting.instance_uuid,
        }
    }

    /// Servers that predate `IPROTO_ID`.
    pub(crate) fn legacy(greeting: &Greeting) -> Self {
        Self {
            protocol_version: 0,
            features: FeatureSet::empty(),
            auth_type: None,
            server_version: greeting.version.clone(),
            instance_uuid: greeting.instance_uuid,
        }
    }
}
