use std::fmt;
use std::str::FromStr;

use url::{form_urlencoded, Url};

use crate::types::{RelayProtocolOptions, Topic, PROTOCOL, PROTOCOL_VERSION};
use crate::ProtocolError;

/// `wc:<topic>@2?relay-protocol=irn&symKey=<hex>[&relay-data=..][&expiryTimestamp=..]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingUri {
    pub protocol: String,
    pub version: u32,
    pub topic: Topic,
    pub sym_key: String,
    pub relay: RelayProtocolOptions,
    /// Unix seconds after which the pairing is no longer offered.
    pub expiry_timestamp: Option<u64>,
}

impl PairingUri {
    pub fn new(topic: Topic, sym_key: String, relay: RelayProtocolOptions, expiry: u64) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            version: PROTOCOL_VERSION,
            topic,
            sym_key,
            relay,
            expiry_timestamp: Some(expiry),
        }
    }
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("relay-protocol", &self.relay.protocol);
        if let Some(data) = &self.relay.data {
            query.append_pair("relay-data", data);
        }
        query.append_pair("symKey", &self.sym_key);
        if let Some(expiry) = self.expiry_timestamp {
            query.append_pair("expiryTimestamp", &expiry.to_string());
        }
        write!(
            f,
            "{}:{}@{}?{}",
            self.protocol,
            self.topic,
            self.version,
            query.finish()
        )
    }
}

fn invalid(uri: &str) -> ProtocolError {
    ProtocolError::MissingOrInvalid(format!("pair() uri: {uri}"))
}

impl FromStr for PairingUri {
    type Err = ProtocolError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(uri).map_err(|_| invalid(uri))?;
        let (topic, version) = url.path().split_once('@').ok_or_else(|| invalid(uri))?;
        if topic.is_empty() {
            return Err(invalid(uri));
        }
        let version: u32 = version.parse().map_err(|_| invalid(uri))?;

        let mut protocol = None;
        let mut data = None;
        let mut sym_key = None;
        let mut expiry_timestamp = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "relay-protocol" => protocol = Some(value.into_owned()),
                "relay-data" => data = Some(value.into_owned()),
                "symKey" => sym_key = Some(value.into_owned()),
                "expiryTimestamp" => {
                    expiry_timestamp = Some(value.parse().map_err(|_| invalid(uri))?)
                }
                _ => {}
            }
        }
        let (Some(protocol), Some(sym_key)) = (protocol, sym_key) else {
            return Err(invalid(uri));
        };
        if protocol.is_empty() || sym_key.is_empty() {
            return Err(invalid(uri));
        }

        Ok(Self {
            protocol: url.scheme().to_string(),
            version,
            topic: topic.to_string(),
            sym_key,
            relay: RelayProtocolOptions { protocol, data },
            expiry_timestamp,
        })
    }
}
