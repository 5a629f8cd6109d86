//! Routing rules.
//!
//! A [`Rule`] tells a visor what to do with a packet carrying a given [`RouteId`]. There are
//! three kinds:
//!
//! - `Consume` rules sit at the end of a route, and hand packets to the local route group.
//! - `Forward` rules sit at the start of a route, and are used by the local route group to send
//!   packets on the first hop.
//! - `Intermediary` rules sit on transit visors, and relay packets to the next hop.
//!
//! The binary layout of a rule is a common header `[keep_alive_ns: u64][type: u8][key: u32]`,
//! followed by a [`RouteDescriptor`] for consume and forward rules, followed by
//! `[next_route_id: u32][next_transport_id: 16 bytes]` for forward and intermediary rules. All
//! integers are big endian.

use core::fmt;
use std::time::Duration;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use super::descriptor::{Port, RouteDescriptor, RouteId, ROUTE_DESCRIPTOR_SIZE};
use crate::{crypto::PublicKey, transport::TransportId};

/// Size of the header shared by all rules.
pub const RULE_HEADER_SIZE: usize = 8 + 1 + 4;

/// Size of the next hop section of forward and intermediary rules.
const NEXT_HOP_SIZE: usize = 4 + 16;

/// Discriminant of a [`Rule`], as used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RuleType {
    Consume = 0,
    Forward = 1,
    Intermediary = 2,
}

impl RuleType {
    /// The exact size of an encoded rule of this type.
    pub const fn encoded_size(self) -> usize {
        match self {
            RuleType::Consume => RULE_HEADER_SIZE + ROUTE_DESCRIPTOR_SIZE,
            RuleType::Forward => RULE_HEADER_SIZE + ROUTE_DESCRIPTOR_SIZE + NEXT_HOP_SIZE,
            RuleType::Intermediary => RULE_HEADER_SIZE + NEXT_HOP_SIZE,
        }
    }
}

impl TryFrom<u8> for RuleType {
    type Error = RuleError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RuleType::Consume),
            1 => Ok(RuleType::Forward),
            2 => Ok(RuleType::Intermediary),
            t => Err(RuleError::InvalidType(t)),
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleType::Consume => "Consume",
            RuleType::Forward => "Forward",
            RuleType::Intermediary => "IntermediaryForward",
        })
    }
}

/// Errors raised while working with [`Rule`]s.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("corrupted rule: need {expected} bytes, got {actual}")]
    Corrupted { expected: usize, actual: usize },
    #[error("invalid rule type {0}")]
    InvalidType(u8),
    #[error("{rule_type} rules have no {field}")]
    NoSuchField {
        rule_type: RuleType,
        field: &'static str,
    },
    #[error("invalid rule summary: {0}")]
    InvalidSummary(&'static str),
}

/// The next hop of a route, as seen from the visor holding the rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NextHop {
    /// The route id the packet must carry when sent to the next visor.
    pub route_id: RouteId,
    /// The transport connecting to the next visor.
    pub transport_id: TransportId,
}

/// What a [`Rule`] does with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Consume {
        desc: RouteDescriptor,
    },
    Forward {
        desc: RouteDescriptor,
        next: NextHop,
    },
    Intermediary {
        next: NextHop,
    },
}

/// A routing rule, keyed by a local [`RouteId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RuleSummary", try_from = "RuleSummary")]
pub struct Rule {
    keep_alive: Duration,
    key_route_id: RouteId,
    kind: RuleKind,
}

impl Rule {
    /// Create a rule which hands packets to the local route group identified by `desc`.
    pub fn consume(keep_alive: Duration, key: RouteId, desc: RouteDescriptor) -> Self {
        Self {
            keep_alive,
            key_route_id: key,
            kind: RuleKind::Consume { desc },
        }
    }

    /// Create a rule which is used by the route group identified by `desc` to send packets on the
    /// first hop of a route.
    pub fn forward(
        keep_alive: Duration,
        key: RouteId,
        next_route_id: RouteId,
        next_transport_id: TransportId,
        desc: RouteDescriptor,
    ) -> Self {
        Self {
            keep_alive,
            key_route_id: key,
            kind: RuleKind::Forward {
                desc,
                next: NextHop {
                    route_id: next_route_id,
                    transport_id: next_transport_id,
                },
            },
        }
    }

    /// Create a rule which relays packets to the next visor on a route.
    pub fn intermediary(
        keep_alive: Duration,
        key: RouteId,
        next_route_id: RouteId,
        next_transport_id: TransportId,
    ) -> Self {
        Self {
            keep_alive,
            key_route_id: key,
            kind: RuleKind::Intermediary {
                next: NextHop {
                    route_id: next_route_id,
                    transport_id: next_transport_id,
                },
            },
        }
    }

    #[inline]
    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn rule_type(&self) -> RuleType {
        match self.kind {
            RuleKind::Consume { .. } => RuleType::Consume,
            RuleKind::Forward { .. } => RuleType::Forward,
            RuleKind::Intermediary { .. } => RuleType::Intermediary,
        }
    }

    /// The amount of time this rule stays valid without activity.
    #[inline]
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// The [`RouteId`] this rule is stored under.
    #[inline]
    pub fn key_route_id(&self) -> RouteId {
        self.key_route_id
    }

    /// Change the [`RouteId`] this rule is stored under.
    #[inline]
    pub fn set_key_route_id(&mut self, key: RouteId) {
        self.key_route_id = key;
    }

    /// The descriptor of the route group this rule belongs to. Only consume and forward rules
    /// have a descriptor.
    pub fn route_descriptor(&self) -> Result<RouteDescriptor, RuleError> {
        match self.kind {
            RuleKind::Consume { desc } | RuleKind::Forward { desc, .. } => Ok(desc),
            RuleKind::Intermediary { .. } => Err(self.no_such_field("route descriptor")),
        }
    }

    /// The next hop of this rule, if any.
    pub fn next_hop(&self) -> Option<NextHop> {
        match self.kind {
            RuleKind::Forward { next, .. } | RuleKind::Intermediary { next } => Some(next),
            RuleKind::Consume { .. } => None,
        }
    }

    /// The route id used on the next hop. Consume rules have no next hop.
    pub fn next_route_id(&self) -> Result<RouteId, RuleError> {
        self.next_hop()
            .map(|next| next.route_id)
            .ok_or_else(|| self.no_such_field("next route id"))
    }

    /// The transport to the next hop. Consume rules have no next hop.
    pub fn next_transport_id(&self) -> Result<TransportId, RuleError> {
        self.next_hop()
            .map(|next| next.transport_id)
            .ok_or_else(|| self.no_such_field("next transport id"))
    }

    fn no_such_field(&self, field: &'static str) -> RuleError {
        RuleError::NoSuchField {
            rule_type: self.rule_type(),
            field,
        }
    }

    /// The size of this rule in binary form.
    pub fn encoded_size(&self) -> usize {
        self.rule_type().encoded_size()
    }

    /// Write the binary form of this rule to the buffer.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u64(u64::try_from(self.keep_alive.as_nanos()).unwrap_or(u64::MAX));
        dst.put_u8(self.rule_type() as u8);
        dst.put_u32(self.key_route_id.as_u32());
        match self.kind {
            RuleKind::Consume { desc } => desc.encode(dst),
            RuleKind::Forward { desc, next } => {
                desc.encode(dst);
                encode_next_hop(&next, dst);
            }
            RuleKind::Intermediary { next } => encode_next_hop(&next, dst),
        }
    }

    /// The binary form of this rule.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf
    }

    /// Decode a rule from its binary form. Trailing bytes are rejected as well.
    pub fn decode(mut src: &[u8]) -> Result<Self, RuleError> {
        if src.len() < RULE_HEADER_SIZE {
            return Err(RuleError::Corrupted {
                expected: RULE_HEADER_SIZE,
                actual: src.len(),
            });
        }
        let actual = src.len();
        let keep_alive = Duration::from_nanos(src.get_u64());
        let rule_type = RuleType::try_from(src.get_u8())?;
        if actual != rule_type.encoded_size() {
            return Err(RuleError::Corrupted {
                expected: rule_type.encoded_size(),
                actual,
            });
        }
        let key_route_id = RouteId::new(src.get_u32());

        let kind = match rule_type {
            RuleType::Consume => RuleKind::Consume {
                desc: RouteDescriptor::decode(&mut src),
            },
            RuleType::Forward => RuleKind::Forward {
                desc: RouteDescriptor::decode(&mut src),
                next: decode_next_hop(&mut src),
            },
            RuleType::Intermediary => RuleKind::Intermediary {
                next: decode_next_hop(&mut src),
            },
        };

        Ok(Self {
            keep_alive,
            key_route_id,
            kind,
        })
    }

    /// Describe this rule in a structured, serializable form.
    pub fn summary(&self) -> RuleSummary {
        let mut summary = RuleSummary {
            keep_alive: self.keep_alive,
            rule_type: self.rule_type(),
            key_route_id: self.key_route_id,
            app_fields: None,
            forward_fields: None,
            intermediary_forward_fields: None,
        };
        match self.kind {
            RuleKind::Consume { desc } => {
                summary.app_fields = Some(RuleConsumeFields {
                    route_descriptor: desc.into(),
                });
            }
            RuleKind::Forward { desc, next } => {
                summary.forward_fields = Some(RuleForwardFields {
                    route_descriptor: desc.into(),
                    next_rid: next.route_id,
                    next_tid: next.transport_id,
                });
            }
            RuleKind::Intermediary { next } => {
                summary.intermediary_forward_fields = Some(RuleIntermediaryForwardFields {
                    next_rid: next.route_id,
                    next_tid: next.transport_id,
                });
            }
        }
        summary
    }
}

fn encode_next_hop(next: &NextHop, dst: &mut impl BufMut) {
    dst.put_u32(next.route_id.as_u32());
    dst.put_slice(next.transport_id.as_bytes());
}

fn decode_next_hop(src: &mut &[u8]) -> NextHop {
    let route_id = RouteId::new(src.get_u32());
    let mut tid = [0; 16];
    src.copy_to_slice(&mut tid);
    NextHop {
        route_id,
        transport_id: TransportId::from_bytes(tid),
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            RuleKind::Consume { desc } => {
                write!(f, "APP(keyRtID:{}, {})", self.key_route_id, desc)
            }
            RuleKind::Forward { desc, next } => write!(
                f,
                "FWD(keyRtID:{}, nxtRtID:{}, nxtTpID:{}, {})",
                self.key_route_id, next.route_id, next.transport_id, desc
            ),
            RuleKind::Intermediary { next } => write!(
                f,
                "IFWD(keyRtID:{}, nxtRtID:{}, nxtTpID:{})",
                self.key_route_id, next.route_id, next.transport_id
            ),
        }
    }
}

/// Structured form of a [`Rule`]. This is also the form rules take when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub keep_alive: Duration,
    pub rule_type: RuleType,
    pub key_route_id: RouteId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_fields: Option<RuleConsumeFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_fields: Option<RuleForwardFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediary_forward_fields: Option<RuleIntermediaryForwardFields>,
}

/// Fields of a consume rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConsumeFields {
    pub route_descriptor: RouteDescriptorFields,
}

/// Fields of a forward rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleForwardFields {
    pub route_descriptor: RouteDescriptorFields,
    pub next_rid: RouteId,
    pub next_tid: TransportId,
}

/// Fields of an intermediary rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleIntermediaryForwardFields {
    pub next_rid: RouteId,
    pub next_tid: TransportId,
}

/// Flattened form of a [`RouteDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptorFields {
    pub dst_pk: PublicKey,
    pub src_pk: PublicKey,
    pub dst_port: Port,
    pub src_port: Port,
}

impl From<RouteDescriptor> for RouteDescriptorFields {
    fn from(desc: RouteDescriptor) -> Self {
        Self {
            dst_pk: desc.dst_pk(),
            src_pk: desc.src_pk(),
            dst_port: desc.dst_port(),
            src_port: desc.src_port(),
        }
    }
}

impl From<RouteDescriptorFields> for RouteDescriptor {
    fn from(fields: RouteDescriptorFields) -> Self {
        RouteDescriptor::new(fields.src_pk, fields.dst_pk, fields.src_port, fields.dst_port)
    }
}

impl RuleSummary {
    /// Build the [`Rule`] described by this summary. Exactly the field set matching the rule
    /// type must be present.
    pub fn to_rule(&self) -> Result<Rule, RuleError> {
        match (
            self.rule_type,
            &self.app_fields,
            &self.forward_fields,
            &self.intermediary_forward_fields,
        ) {
            (RuleType::Consume, Some(app), None, None) => Ok(Rule::consume(
                self.keep_alive,
                self.key_route_id,
                app.route_descriptor.into(),
            )),
            (RuleType::Consume, ..) => Err(RuleError::InvalidSummary(
                "consume rule needs exactly the app fields",
            )),
            (RuleType::Forward, None, Some(fwd), None) => Ok(Rule::forward(
                self.keep_alive,
                self.key_route_id,
                fwd.next_rid,
                fwd.next_tid,
                fwd.route_descriptor.into(),
            )),
            (RuleType::Forward, ..) => Err(RuleError::InvalidSummary(
                "forward rule needs exactly the forward fields",
            )),
            (RuleType::Intermediary, None, None, Some(inter)) => Ok(Rule::intermediary(
                self.keep_alive,
                self.key_route_id,
                inter.next_rid,
                inter.next_tid,
            )),
            (RuleType::Intermediary, ..) => Err(RuleError::InvalidSummary(
                "intermediary rule needs exactly the intermediary forward fields",
            )),
        }
    }
}

impl From<Rule> for RuleSummary {
    fn from(rule: Rule) -> Self {
        rule.summary()
    }
}

impl TryFrom<RuleSummary> for Rule {
    type Error = RuleError;

    fn try_from(summary: RuleSummary) -> Result<Self, Self::Error> {
        summary.to_rule()
    }
}
