//! MQTT 5 property system.
//!
//! Most MQTT 5 packets carry a property block: a variable byte integer
//! total length followed by repeated (identifier, value) pairs, where each
//! one-byte identifier implies a fixed wire type. User property (38) is
//! the only identifier allowed to repeat; every occurrence is kept, in
//! order. An identifier outside the known set fails decoding, since its
//! value size cannot be inferred.

use crate::error::{CodecError, Result};
use crate::packet::Reader;
use crate::varint;

/// Property identifiers defined by MQTT 5.0.
pub mod prop {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 1;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 2;
    pub const CONTENT_TYPE: u8 = 3;
    pub const RESPONSE_TOPIC: u8 = 8;
    pub const CORRELATION_DATA: u8 = 9;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 11;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 17;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 18;
    pub const SERVER_KEEP_ALIVE: u8 = 19;
    pub const AUTHENTICATION_METHOD: u8 = 21;
    pub const AUTHENTICATION_DATA: u8 = 22;
    pub const REQUEST_PROBLEM_INFORMATION: u8 = 23;
    pub const WILL_DELAY_INTERVAL: u8 = 24;
    pub const REQUEST_RESPONSE_INFORMATION: u8 = 25;
    pub const RESPONSE_INFORMATION: u8 = 26;
    pub const SERVER_REFERENCE: u8 = 28;
    pub const REASON_STRING: u8 = 31;
    pub const RECEIVE_MAXIMUM: u8 = 33;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 34;
    pub const TOPIC_ALIAS: u8 = 35;
    pub const MAXIMUM_QOS: u8 = 36;
    pub const RETAIN_AVAILABLE: u8 = 37;
    pub const USER_PROPERTY: u8 = 38;
    pub const MAXIMUM_PACKET_SIZE: u8 = 39;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 40;
    pub const SUBSCRIPTION_IDENTIFIER_AVAILABLE: u8 = 41;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 42;
}

/// User defined key/value properties.
///
/// Pairs are kept in wire order; the same key may appear several times, in
/// which case `values` exposes them as an ordered list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProperties {
    pairs: Vec<(String, String)>,
}

impl UserProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// All values recorded for `key`, in the order they appeared.
    pub fn values(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.pairs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }
}

impl FromIterator<(String, String)> for UserProperties {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

// Encoding helpers. Each writes one (identifier, value) pair.

fn put_u8(out: &mut Vec<u8>, id: u8, value: u8) {
    out.push(id);
    out.push(value);
}

fn put_bool(out: &mut Vec<u8>, id: u8, value: bool) {
    put_u8(out, id, value as u8);
}

fn put_u16(out: &mut Vec<u8>, id: u8, value: u16) {
    out.push(id);
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, id: u8, value: u32) {
    out.push(id);
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_varint(out: &mut Vec<u8>, id: u8, value: usize) {
    out.push(id);
    varint::encode_to_vec(value, out);
}

fn put_str(out: &mut Vec<u8>, id: u8, value: &str) {
    out.push(id);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn put_bin(out: &mut Vec<u8>, id: u8, value: &[u8]) {
    out.push(id);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

fn put_user(out: &mut Vec<u8>, user: &UserProperties) {
    for (key, value) in user.iter() {
        out.push(prop::USER_PROPERTY);
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&(value.len() as u16).to_be_bytes());
        out.extend_from_slice(value.as_bytes());
    }
}

/// Prefix an already built property body with its variable integer length.
fn finish(body: Vec<u8>, out: &mut Vec<u8>) {
    varint::encode_to_vec(body.len(), out);
    out.extend_from_slice(&body);
}

// Decoding helpers.

fn read_bool(r: &mut Reader) -> Result<bool> {
    Ok(r.read_u8()? != 0)
}

fn read_user_pair(r: &mut Reader, user: &mut UserProperties) -> Result<()> {
    let key = r.read_string()?;
    let value = r.read_string()?;
    user.push(key, value);
    Ok(())
}

/// Read the block length and return (block end position, block was
/// non-empty).
fn block_bounds(r: &mut Reader) -> Result<(usize, bool)> {
    let len = r.read_varint()?;
    if len > r.remaining() {
        return Err(CodecError::bad("property block length out of bounds"));
    }
    Ok((r.position() + len, len > 0))
}

fn check_block_end(r: &Reader, end: usize) -> Result<()> {
    if r.position() != end {
        return Err(CodecError::bad("property overruns its block"));
    }
    Ok(())
}

fn unknown(packet: &str, id: u8) -> CodecError {
    CodecError::bad(format!("unknown {packet} property identifier {id}"))
}

/// CONNECT properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
    pub request_response_information: bool,
    pub request_problem_information: bool,
    pub user_properties: UserProperties,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
}

impl ConnectProperties {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(v) = self.session_expiry_interval {
            put_u32(&mut body, prop::SESSION_EXPIRY_INTERVAL, v);
        }
        if let Some(v) = self.receive_maximum {
            put_u16(&mut body, prop::RECEIVE_MAXIMUM, v);
        }
        if let Some(v) = self.maximum_packet_size {
            put_u32(&mut body, prop::MAXIMUM_PACKET_SIZE, v);
        }
        if let Some(v) = self.topic_alias_maximum {
            put_u16(&mut body, prop::TOPIC_ALIAS_MAXIMUM, v);
        }
        if self.request_response_information {
            put_bool(&mut body, prop::REQUEST_RESPONSE_INFORMATION, true);
        }
        if self.request_problem_information {
            put_bool(&mut body, prop::REQUEST_PROBLEM_INFORMATION, true);
        }
        put_user(&mut body, &self.user_properties);
        if let Some(ref v) = self.authentication_method {
            put_str(&mut body, prop::AUTHENTICATION_METHOD, v);
        }
        if let Some(ref v) = self.authentication_data {
            put_bin(&mut body, prop::AUTHENTICATION_DATA, v);
        }
        finish(body, out);
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Option<Self>> {
        let (end, any) = block_bounds(r)?;
        let mut p = Self::default();
        while r.position() < end {
            match r.read_u8()? {
                prop::SESSION_EXPIRY_INTERVAL => p.session_expiry_interval = Some(r.read_u32()?),
                prop::RECEIVE_MAXIMUM => p.receive_maximum = Some(r.read_u16()?),
                prop::MAXIMUM_PACKET_SIZE => p.maximum_packet_size = Some(r.read_u32()?),
                prop::TOPIC_ALIAS_MAXIMUM => p.topic_alias_maximum = Some(r.read_u16()?),
                prop::REQUEST_RESPONSE_INFORMATION => {
                    p.request_response_information = read_bool(r)?
                }
                prop::REQUEST_PROBLEM_INFORMATION => p.request_problem_information = read_bool(r)?,
                prop::USER_PROPERTY => read_user_pair(r, &mut p.user_properties)?,
                prop::AUTHENTICATION_METHOD => p.authentication_method = Some(r.read_string()?),
                prop::AUTHENTICATION_DATA => p.authentication_data = Some(r.read_binary()?),
                other => return Err(unknown("CONNECT", other)),
            }
        }
        check_block_end(r, end)?;
        Ok(any.then_some(p))
    }
}

/// Will properties carried inside CONNECT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WillProperties {
    pub will_delay_interval: Option<u32>,
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: UserProperties,
}

impl WillProperties {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(v) = self.will_delay_interval {
            put_u32(&mut body, prop::WILL_DELAY_INTERVAL, v);
        }
        if let Some(v) = self.payload_format_indicator {
            put_u8(&mut body, prop::PAYLOAD_FORMAT_INDICATOR, v);
        }
        if let Some(v) = self.message_expiry_interval {
            put_u32(&mut body, prop::MESSAGE_EXPIRY_INTERVAL, v);
        }
        if let Some(ref v) = self.content_type {
            put_str(&mut body, prop::CONTENT_TYPE, v);
        }
        if let Some(ref v) = self.response_topic {
            put_str(&mut body, prop::RESPONSE_TOPIC, v);
        }
        if let Some(ref v) = self.correlation_data {
            put_bin(&mut body, prop::CORRELATION_DATA, v);
        }
        put_user(&mut body, &self.user_properties);
        finish(body, out);
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Option<Self>> {
        let (end, any) = block_bounds(r)?;
        let mut p = Self::default();
        while r.position() < end {
            match r.read_u8()? {
                prop::WILL_DELAY_INTERVAL => p.will_delay_interval = Some(r.read_u32()?),
                prop::PAYLOAD_FORMAT_INDICATOR => p.payload_format_indicator = Some(r.read_u8()?),
                prop::MESSAGE_EXPIRY_INTERVAL => p.message_expiry_interval = Some(r.read_u32()?),
                prop::CONTENT_TYPE => p.content_type = Some(r.read_string()?),
                prop::RESPONSE_TOPIC => p.response_topic = Some(r.read_string()?),
                prop::CORRELATION_DATA => p.correlation_data = Some(r.read_binary()?),
                prop::USER_PROPERTY => read_user_pair(r, &mut p.user_properties)?,
                other => return Err(unknown("will", other)),
            }
        }
        check_block_end(r, end)?;
        Ok(any.then_some(p))
    }
}

/// CONNACK properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnackProperties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<bool>,
    pub maximum_packet_size: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub topic_alias_maximum: Option<u16>,
    pub reason_string: Option<String>,
    pub user_properties: UserProperties,
    pub wildcard_subscription_available: Option<bool>,
    pub subscription_identifiers_available: Option<bool>,
    pub shared_subscription_available: Option<bool>,
    pub server_keep_alive: Option<u16>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
}

impl ConnackProperties {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(v) = self.session_expiry_interval {
            put_u32(&mut body, prop::SESSION_EXPIRY_INTERVAL, v);
        }
        if let Some(v) = self.receive_maximum {
            put_u16(&mut body, prop::RECEIVE_MAXIMUM, v);
        }
        if let Some(v) = self.maximum_qos {
            put_u8(&mut body, prop::MAXIMUM_QOS, v);
        }
        if let Some(v) = self.retain_available {
            put_bool(&mut body, prop::RETAIN_AVAILABLE, v);
        }
        if let Some(v) = self.maximum_packet_size {
            put_u32(&mut body, prop::MAXIMUM_PACKET_SIZE, v);
        }
        if let Some(ref v) = self.assigned_client_identifier {
            put_str(&mut body, prop::ASSIGNED_CLIENT_IDENTIFIER, v);
        }
        if let Some(v) = self.topic_alias_maximum {
            put_u16(&mut body, prop::TOPIC_ALIAS_MAXIMUM, v);
        }
        if let Some(ref v) = self.reason_string {
            put_str(&mut body, prop::REASON_STRING, v);
        }
        put_user(&mut body, &self.user_properties);
        if let Some(v) = self.wildcard_subscription_available {
            put_bool(&mut body, prop::WILDCARD_SUBSCRIPTION_AVAILABLE, v);
        }
        if let Some(v) = self.subscription_identifiers_available {
            put_bool(&mut body, prop::SUBSCRIPTION_IDENTIFIER_AVAILABLE, v);
        }
        if let Some(v) = self.shared_subscription_available {
            put_bool(&mut body, prop::SHARED_SUBSCRIPTION_AVAILABLE, v);
        }
        if let Some(v) = self.server_keep_alive {
            put_u16(&mut body, prop::SERVER_KEEP_ALIVE, v);
        }
        if let Some(ref v) = self.response_information {
            put_str(&mut body, prop::RESPONSE_INFORMATION, v);
        }
        if let Some(ref v) = self.server_reference {
            put_str(&mut body, prop::SERVER_REFERENCE, v);
        }
        if let Some(ref v) = self.authentication_method {
            put_str(&mut body, prop::AUTHENTICATION_METHOD, v);
        }
        if let Some(ref v) = self.authentication_data {
            put_bin(&mut body, prop::AUTHENTICATION_DATA, v);
        }
        finish(body, out);
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Option<Self>> {
        let (end, any) = block_bounds(r)?;
        let mut p = Self::default();
        while r.position() < end {
            match r.read_u8()? {
                prop::SESSION_EXPIRY_INTERVAL => p.session_expiry_interval = Some(r.read_u32()?),
                prop::RECEIVE_MAXIMUM => p.receive_maximum = Some(r.read_u16()?),
                prop::MAXIMUM_QOS => p.maximum_qos = Some(r.read_u8()?),
                prop::RETAIN_AVAILABLE => p.retain_available = Some(read_bool(r)?),
                prop::MAXIMUM_PACKET_SIZE => p.maximum_packet_size = Some(r.read_u32()?),
                prop::ASSIGNED_CLIENT_IDENTIFIER => {
                    p.assigned_client_identifier = Some(r.read_string()?)
                }
                prop::TOPIC_ALIAS_MAXIMUM => p.topic_alias_maximum = Some(r.read_u16()?),
                prop::REASON_STRING => p.reason_string = Some(r.read_string()?),
                prop::USER_PROPERTY => read_user_pair(r, &mut p.user_properties)?,
                prop::WILDCARD_SUBSCRIPTION_AVAILABLE => {
                    p.wildcard_subscription_available = Some(read_bool(r)?)
                }
                prop::SUBSCRIPTION_IDENTIFIER_AVAILABLE => {
                    p.subscription_identifiers_available = Some(read_bool(r)?)
                }
                prop::SHARED_SUBSCRIPTION_AVAILABLE => {
                    p.shared_subscription_available = Some(read_bool(r)?)
                }
                prop::SERVER_KEEP_ALIVE => p.server_keep_alive = Some(r.read_u16()?),
                prop::RESPONSE_INFORMATION => p.response_information = Some(r.read_string()?),
                prop::SERVER_REFERENCE => p.server_reference = Some(r.read_string()?),
                prop::AUTHENTICATION_METHOD => p.authentication_method = Some(r.read_string()?),
                prop::AUTHENTICATION_DATA => p.authentication_data = Some(r.read_binary()?),
                other => return Err(unknown("CONNACK", other)),
            }
        }
        check_block_end(r, end)?;
        Ok(any.then_some(p))
    }
}

/// PUBLISH properties.
///
/// Topic alias (35) is transported verbatim; the client neither allocates
/// nor caches aliases.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub topic_alias: Option<u16>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: UserProperties,
    pub subscription_identifier: Option<usize>,
    pub content_type: Option<String>,
}

impl PublishProperties {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(v) = self.payload_format_indicator {
            put_u8(&mut body, prop::PAYLOAD_FORMAT_INDICATOR, v);
        }
        if let Some(v) = self.message_expiry_interval {
            put_u32(&mut body, prop::MESSAGE_EXPIRY_INTERVAL, v);
        }
        if let Some(v) = self.topic_alias {
            put_u16(&mut body, prop::TOPIC_ALIAS, v);
        }
        if let Some(ref v) = self.response_topic {
            put_str(&mut body, prop::RESPONSE_TOPIC, v);
        }
        if let Some(ref v) = self.correlation_data {
            put_bin(&mut body, prop::CORRELATION_DATA, v);
        }
        put_user(&mut body, &self.user_properties);
        if let Some(v) = self.subscription_identifier {
            put_varint(&mut body, prop::SUBSCRIPTION_IDENTIFIER, v);
        }
        if let Some(ref v) = self.content_type {
            put_str(&mut body, prop::CONTENT_TYPE, v);
        }
        finish(body, out);
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Option<Self>> {
        let (end, any) = block_bounds(r)?;
        let mut p = Self::default();
        while r.position() < end {
            match r.read_u8()? {
                prop::PAYLOAD_FORMAT_INDICATOR => p.payload_format_indicator = Some(r.read_u8()?),
                prop::MESSAGE_EXPIRY_INTERVAL => p.message_expiry_interval = Some(r.read_u32()?),
                prop::TOPIC_ALIAS => p.topic_alias = Some(r.read_u16()?),
                prop::RESPONSE_TOPIC => p.response_topic = Some(r.read_string()?),
                prop::CORRELATION_DATA => p.correlation_data = Some(r.read_binary()?),
                prop::USER_PROPERTY => read_user_pair(r, &mut p.user_properties)?,
                prop::SUBSCRIPTION_IDENTIFIER => p.subscription_identifier = Some(r.read_varint()?),
                prop::CONTENT_TYPE => p.content_type = Some(r.read_string()?),
                other => return Err(unknown("PUBLISH", other)),
            }
        }
        check_block_end(r, end)?;
        Ok(any.then_some(p))
    }
}

/// Properties for the acknowledgement packets (PUBACK, PUBREC, PUBREL,
/// PUBCOMP, SUBACK, UNSUBACK).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AckProperties {
    pub reason_string: Option<String>,
    pub user_properties: UserProperties,
}

impl AckProperties {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(ref v) = self.reason_string {
            put_str(&mut body, prop::REASON_STRING, v);
        }
        put_user(&mut body, &self.user_properties);
        finish(body, out);
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Option<Self>> {
        let (end, any) = block_bounds(r)?;
        let mut p = Self::default();
        while r.position() < end {
            match r.read_u8()? {
                prop::REASON_STRING => p.reason_string = Some(r.read_string()?),
                prop::USER_PROPERTY => read_user_pair(r, &mut p.user_properties)?,
                other => return Err(unknown("acknowledgement", other)),
            }
        }
        check_block_end(r, end)?;
        Ok(any.then_some(p))
    }
}

/// SUBSCRIBE properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeProperties {
    pub subscription_identifier: Option<usize>,
    pub user_properties: UserProperties,
}

impl SubscribeProperties {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(v) = self.subscription_identifier {
            put_varint(&mut body, prop::SUBSCRIPTION_IDENTIFIER, v);
        }
        put_user(&mut body, &self.user_properties);
        finish(body, out);
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Option<Self>> {
        let (end, any) = block_bounds(r)?;
        let mut p = Self::default();
        while r.position() < end {
            match r.read_u8()? {
                prop::SUBSCRIPTION_IDENTIFIER => p.subscription_identifier = Some(r.read_varint()?),
                prop::USER_PROPERTY => read_user_pair(r, &mut p.user_properties)?,
                other => return Err(unknown("SUBSCRIBE", other)),
            }
        }
        check_block_end(r, end)?;
        Ok(any.then_some(p))
    }
}

/// UNSUBSCRIBE properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnsubscribeProperties {
    pub user_properties: UserProperties,
}

impl UnsubscribeProperties {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        put_user(&mut body, &self.user_properties);
        finish(body, out);
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Option<Self>> {
        let (end, any) = block_bounds(r)?;
        let mut p = Self::default();
        while r.position() < end {
            match r.read_u8()? {
                prop::USER_PROPERTY => read_user_pair(r, &mut p.user_properties)?,
                other => return Err(unknown("UNSUBSCRIBE", other)),
            }
        }
        check_block_end(r, end)?;
        Ok(any.then_some(p))
    }
}

/// DISCONNECT properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisconnectProperties {
    pub session_expiry_interval: Option<u32>,
    pub reason_string: Option<String>,
    pub user_properties: UserProperties,
    pub server_reference: Option<String>,
}

impl DisconnectProperties {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(v) = self.session_expiry_interval {
            put_u32(&mut body, prop::SESSION_EXPIRY_INTERVAL, v);
        }
        if let Some(ref v) = self.reason_string {
            put_str(&mut body, prop::REASON_STRING, v);
        }
        put_user(&mut body, &self.user_properties);
        if let Some(ref v) = self.server_reference {
            put_str(&mut body, prop::SERVER_REFERENCE, v);
        }
        finish(body, out);
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Option<Self>> {
        let (end, any) = block_bounds(r)?;
        let mut p = Self::default();
        while r.position() < end {
            match r.read_u8()? {
                prop::SESSION_EXPIRY_INTERVAL => p.session_expiry_interval = Some(r.read_u32()?),
                prop::REASON_STRING => p.reason_string = Some(r.read_string()?),
                prop::USER_PROPERTY => read_user_pair(r, &mut p.user_properties)?,
                prop::SERVER_REFERENCE => p.server_reference = Some(r.read_string()?),
                other => return Err(unknown("DISCONNECT", other)),
            }
        }
        check_block_end(r, end)?;
        Ok(any.then_some(p))
    }
}

/// AUTH properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthProperties {
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Vec<u8>>,
    pub reason_string: Option<String>,
    pub user_properties: UserProperties,
}

impl AuthProperties {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        if let Some(ref v) = self.authentication_method {
            put_str(&mut body, prop::AUTHENTICATION_METHOD, v);
        }
        if let Some(ref v) = self.authentication_data {
            put_bin(&mut body, prop::AUTHENTICATION_DATA, v);
        }
        if let Some(ref v) = self.reason_string {
            put_str(&mut body, prop::REASON_STRING, v);
        }
        put_user(&mut body, &self.user_properties);
        finish(body, out);
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Option<Self>> {
        let (end, any) = block_bounds(r)?;
        let mut p = Self::default();
        while r.position() < end {
            match r.read_u8()? {
                prop::AUTHENTICATION_METHOD => p.authentication_method = Some(r.read_string()?),
                prop::AUTHENTICATION_DATA => p.authentication_data = Some(r.read_binary()?),
                prop::REASON_STRING => p.reason_string = Some(r.read_string()?),
                prop::USER_PROPERTY => read_user_pair(r, &mut p.user_properties)?,
                other => return Err(unknown("AUTH", other)),
            }
        }
        check_block_end(r, end)?;
        Ok(any.then_some(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Reader;

    #[test]
    fn user_properties_collect_repeats_in_order() {
        let mut user = UserProperties::new();
        user.push("k", "v1");
        user.push("other", "x");
        user.push("k", "v2");

        assert_eq!(user.values("k"), vec!["v1", "v2"]);
        assert_eq!(user.values("other"), vec!["x"]);
        assert!(user.values("missing").is_empty());
        assert_eq!(user.len(), 3);
    }

    #[test]
    fn publish_properties_round_trip() {
        let mut user = UserProperties::new();
        user.push("k", "v1");
        user.push("k", "v2");
        let props = PublishProperties {
            payload_format_indicator: Some(1),
            content_type: Some("text/plain".into()),
            user_properties: user,
            ..Default::default()
        };

        let mut buf = Vec::new();
        props.encode(&mut buf);
        let mut r = Reader::new(&buf);
        let decoded = PublishProperties::decode(&mut r).unwrap().unwrap();
        assert_eq!(decoded, props);
        assert_eq!(r.remaining(), 0);
        assert_eq!(decoded.user_properties.values("k"), vec!["v1", "v2"]);
    }

    #[test]
    fn empty_block_decodes_to_none() {
        let props = AckProperties::default();
        let mut buf = Vec::new();
        props.encode(&mut buf);
        assert_eq!(buf, vec![0x00]);

        let mut r = Reader::new(&buf);
        assert_eq!(AckProperties::decode(&mut r).unwrap(), None);
    }

    #[test]
    fn unknown_identifier_is_rejected() {
        // Length 2: unknown identifier 99 with one byte of value.
        let buf = [0x02, 99, 0x01];
        let mut r = Reader::new(&buf);
        assert!(matches!(
            PublishProperties::decode(&mut r),
            Err(CodecError::BadPacket(_))
        ));
    }

    #[test]
    fn overlong_block_is_rejected() {
        // Declared length reaches past the buffer.
        let buf = [0x7F, 0x01];
        let mut r = Reader::new(&buf);
        assert!(matches!(
            AckProperties::decode(&mut r),
            Err(CodecError::BadPacket(_))
        ));
    }

    #[test]
    fn connack_properties_round_trip() {
        let props = ConnackProperties {
            session_expiry_interval: Some(120),
            receive_maximum: Some(24),
            maximum_qos: Some(1),
            assigned_client_identifier: Some("generated-17".into()),
            server_keep_alive: Some(30),
            ..Default::default()
        };
        let mut buf = Vec::new();
        props.encode(&mut buf);
        let mut r = Reader::new(&buf);
        assert_eq!(ConnackProperties::decode(&mut r).unwrap(), Some(props));
    }
}
