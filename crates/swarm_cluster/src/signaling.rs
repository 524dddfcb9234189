//! Offer/answer/candidate parsing for the peer handshake.
//!
//! Only the parts of SDP and ICE candidate syntax the scheduler relies on
//! are checked. Anything malformed is reported as a plain reason string;
//! the transport manager wraps it into `SignalingError` and charges it
//! against the peer's retry budget.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Sub-channel labels bundled into every session
pub const BUNDLE: &str = "control task result";

/// Which side of the handshake produced a description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    /// Initiator's description
    Offer,
    /// Responder's description
    Answer,
}

/// A session description exchanged during signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// Session identifier from the origin line
    pub session_id: u64,
    /// Raw SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Build the description this scheduler sends
    #[must_use]
    pub fn local(kind: SdpKind, session_id: u64) -> Self {
        let sdp = format!(
            "v=0\r\no=swarm {session_id} 1 IN IP4 0.0.0.0\r\ns=swarm\r\nt=0 0\r\na=group:BUNDLE {BUNDLE}\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n"
        );
        Self { kind, session_id, sdp }
    }

    /// Parse a remote description
    ///
    /// # Errors
    ///
    /// Returns the reason when the version line, origin line or session
    /// name is missing or malformed
    pub fn parse(kind: SdpKind, sdp: &str) -> Result<Self, String> {
        let mut lines = sdp.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some("v=0") {
            return Err("description must start with v=0".to_string());
        }

        let mut session_id = None;
        let mut has_name = false;
        for line in lines {
            if let Some(origin) = line.strip_prefix("o=") {
                let fields: Vec<&str> = origin.split_whitespace().collect();
                if fields.len() != 6 {
                    return Err(format!("origin line has {} fields, expected 6", fields.len()));
                }
                let id = fields[1]
                    .parse::<u64>()
                    .map_err(|_| format!("session id '{}' is not numeric", fields[1]))?;
                session_id = Some(id);
            } else if line.starts_with("s=") {
                has_name = true;
            }
        }

        let session_id = session_id.ok_or_else(|| "missing origin line".to_string())?;
        if !has_name {
            return Err("missing session name line".to_string());
        }
        Ok(Self { kind, session_id, sdp: sdp.to_string() })
    }
}

/// Transport protocol of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateProtocol {
    /// UDP
    Udp,
    /// TCP
    Tcp,
}

/// How a candidate address was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    /// Local interface
    Host,
    /// Server reflexive
    Srflx,
    /// Peer reflexive
    Prflx,
    /// Relayed
    Relay,
}

/// A connectivity candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Foundation
    pub foundation: String,
    /// Component ID
    pub component: u16,
    /// Protocol
    pub protocol: CandidateProtocol,
    /// Priority
    pub priority: u32,
    /// Address
    pub address: IpAddr,
    /// Port
    pub port: u16,
    /// Candidate type
    pub kind: CandidateType,
}

impl Candidate {
    /// Parse `candidate:<foundation> <component> <proto> <priority> <ip> <port> typ <type>`
    ///
    /// A leading `a=` is accepted; trailing extension attributes are ignored.
    ///
    /// # Errors
    ///
    /// Returns the reason for the first field that fails to parse
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let body = line
            .strip_prefix("candidate:")
            .ok_or_else(|| "candidate must start with 'candidate:'".to_string())?;
        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(format!("candidate has {} fields, expected at least 8", fields.len()));
        }

        let component = fields[1]
            .parse::<u16>()
            .map_err(|_| format!("bad component '{}'", fields[1]))?;
        let protocol = match fields[2].to_ascii_lowercase().as_str() {
            "udp" => CandidateProtocol::Udp,
            "tcp" => CandidateProtocol::Tcp,
            other => return Err(format!("unknown protocol '{}'", other)),
        };
        let priority = fields[3]
            .parse::<u32>()
            .map_err(|_| format!("bad priority '{}'", fields[3]))?;
        let address = fields[4]
            .parse::<IpAddr>()
            .map_err(|_| format!("bad address '{}'", fields[4]))?;
        let port = fields[5]
            .parse::<u16>()
            .map_err(|_| format!("bad port '{}'", fields[5]))?;
        if fields[6] != "typ" {
            return Err(format!("expected 'typ', found '{}'", fields[6]));
        }
        let kind = match fields[7] {
            "host" => CandidateType::Host,
            "srflx" => CandidateType::Srflx,
            "prflx" => CandidateType::Prflx,
            "relay" => CandidateType::Relay,
            other => return Err(format!("unknown candidate type '{}'", other)),
        };

        Ok(Self {
            foundation: fields[0].to_string(),
            component,
            protocol,
            priority,
            address,
            port,
            kind,
        })
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let protocol = match self.protocol {
            CandidateProtocol::Udp => "udp",
            CandidateProtocol::Tcp => "tcp",
        };
        let kind = match self.kind {
            CandidateType::Host => "host",
            CandidateType::Srflx => "srflx",
            CandidateType::Prflx => "prflx",
            CandidateType::Relay => "relay",
        };
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation, self.component, protocol, self.priority, self.address, self.port, kind
        )
    }
}
