//! Structural candidate parsing and declarative accept/reject policy

use super::IceCandidate;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Candidate route type (`typ` attribute)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl FromStr for CandidateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::Srflx),
            "prflx" => Ok(CandidateType::Prflx),
            "relay" => Ok(CandidateType::Relay),
            other => Err(Error::IceCandidateError(format!(
                "unknown candidate type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CandidateType::Host => "host",
            CandidateType::Srflx => "srflx",
            CandidateType::Prflx => "prflx",
            CandidateType::Relay => "relay",
        };
        f.write_str(name)
    }
}

/// Candidate transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// Fields of a `candidate:` attribute line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCandidate {
    pub foundation: String,
    pub component: u16,
    pub protocol: TransportProtocol,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    pub tcp_type: Option<String>,
}

impl ParsedCandidate {
    /// Parse the attribute line of a candidate
    ///
    /// Accepts the line with or without the `a=` prefix. Trailing extension
    /// attributes (`raddr`, `generation`, `ufrag`, ...) are ignored apart
    /// from `tcptype`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let body = line.strip_prefix("candidate:").ok_or_else(|| {
            Error::IceCandidateError(format!("missing candidate: prefix in {:?}", line))
        })?;

        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(Error::IceCandidateError(format!(
                "expected at least 8 fields, got {} in {:?}",
                fields.len(),
                line
            )));
        }

        let malformed =
            |what: &str| Error::IceCandidateError(format!("invalid {} in {:?}", what, line));

        let component = fields[1].parse::<u16>().map_err(|_| malformed("component"))?;
        let protocol = match fields[2].to_ascii_lowercase().as_str() {
            "udp" => TransportProtocol::Udp,
            "tcp" => TransportProtocol::Tcp,
            _ => return Err(malformed("transport")),
        };
        let priority = fields[3].parse::<u32>().map_err(|_| malformed("priority"))?;
        let port = fields[5].parse::<u16>().map_err(|_| malformed("port"))?;

        if fields[6] != "typ" {
            return Err(malformed("typ marker"));
        }
        let candidate_type = fields[7].parse::<CandidateType>()?;

        let tcp_type = fields[8..]
            .chunks(2)
            .find(|pair| pair.len() == 2 && pair[0] == "tcptype")
            .map(|pair| pair[1].to_string());

        Ok(Self {
            foundation: fields[0].to_string(),
            component,
            protocol,
            priority,
            address: fields[4].to_string(),
            port,
            candidate_type,
            tcp_type,
        })
    }
}

/// Outcome of evaluating a candidate against a filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

/// Pluggable accept/reject rule applied to every parsed candidate
pub trait CandidateFilter: Send + Sync {
    fn evaluate(&self, candidate: &ParsedCandidate) -> Verdict;
}

/// When TCP candidates are acceptable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TcpPolicy {
    /// Only host TCP candidates
    HostOnly,
    Always,
    Never,
}

/// Declarative default filter
///
/// The default denies relay candidates so that direct routing is preferred,
/// and allows TCP only for host candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CandidatePolicy {
    pub denied_types: Vec<CandidateType>,
    pub tcp: TcpPolicy,
    /// Address prefixes never offered or accepted (e.g. `"169.254."`)
    pub denied_address_prefixes: Vec<String>,
}

impl Default for CandidatePolicy {
    fn default() -> Self {
        Self {
            denied_types: vec![CandidateType::Relay],
            tcp: TcpPolicy::HostOnly,
            denied_address_prefixes: Vec::new(),
        }
    }
}

impl CandidatePolicy {
    /// Accept every well-formed candidate
    pub fn permissive() -> Self {
        Self {
            denied_types: Vec::new(),
            tcp: TcpPolicy::Always,
            denied_address_prefixes: Vec::new(),
        }
    }

    pub fn denies(&self, candidate_type: CandidateType) -> bool {
        self.denied_types.contains(&candidate_type)
    }

    /// Remove a candidate type from the deny list
    pub fn allow(&mut self, candidate_type: CandidateType) {
        self.denied_types.retain(|t| *t != candidate_type);
    }

    pub fn validate(&self) -> Result<()> {
        if self.denied_address_prefixes.iter().any(|p| p.is_empty()) {
            return Err(Error::InvalidConfig(
                "candidatePolicy.deniedAddressPrefixes must not contain empty prefixes"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

impl CandidateFilter for CandidatePolicy {
    fn evaluate(&self, candidate: &ParsedCandidate) -> Verdict {
        if self.denied_types.contains(&candidate.candidate_type) {
            return Verdict::Reject(format!("{} candidates denied", candidate.candidate_type));
        }

        if candidate.protocol == TransportProtocol::Tcp {
            let allowed = match self.tcp {
                TcpPolicy::Always => true,
                TcpPolicy::Never => false,
                TcpPolicy::HostOnly => candidate.candidate_type == CandidateType::Host,
            };
            if !allowed {
                return Verdict::Reject(format!(
                    "tcp {} candidate denied",
                    candidate.candidate_type
                ));
            }
        }

        if let Some(prefix) = self
            .denied_address_prefixes
            .iter()
            .find(|p| candidate.address.starts_with(p.as_str()))
        {
            return Verdict::Reject(format!("address prefix {} denied", prefix));
        }

        Verdict::Accept
    }
}

/// Parse and filter a candidate
///
/// Malformed and policy-rejected candidates both produce
/// [`Error::IceCandidateError`]; callers drop them and log.
pub fn screen(filter: &dyn CandidateFilter, candidate: &IceCandidate) -> Result<ParsedCandidate> {
    let parsed = ParsedCandidate::parse(&candidate.candidate)?;
    match filter.evaluate(&parsed) {
        Verdict::Accept => Ok(parsed),
        Verdict::Reject(reason) => Err(Error::IceCandidateError(reason)),
    }
}
