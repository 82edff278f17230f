// Combined NetworkBehaviour for a Ptt node
//
// - request_response: one Ptt frame per request
// - identify: exchange listen addresses
// - ping: keep idle entity connections alive

use libp2p::{
    identify, ping,
    request_response::{self, ProtocolSupport},
    swarm::NetworkBehaviour,
    StreamProtocol,
};
use std::time::Duration;

pub const FRAME_PROTOCOL: &str = "/ptt/frame/1.0.0";
pub const IDENTIFY_PROTOCOL: &str = "/ptt/id/1.0.0";

#[derive(NetworkBehaviour)]
pub struct PttBehaviour {
    pub frames: request_response::cbor::Behaviour<FrameRequest, FrameResponse>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

/// A marshalled `PttData` frame.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FrameRequest {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FrameResponse {
    pub accepted: bool,
    pub error: Option<String>,
}

impl PttBehaviour {
    pub fn new(keypair: &libp2p::identity::Keypair) -> Self {
        let frames = request_response::cbor::Behaviour::new(
            [(StreamProtocol::new(FRAME_PROTOCOL), ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(Duration::from_secs(30)),
        );

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                .with_interval(Duration::from_secs(60)),
        );

        Self {
            frames,
            identify,
            ping: ping::Behaviour::new(ping::Config::new()),
        }
    }
}
