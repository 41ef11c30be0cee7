//! Event decoding.
//!
//! Each contract kind has an interface description (a JSON ABI) mapping event
//! selectors to method names. A recognized method is decoded once, here, into
//! a closed enum; methods the description knows but the engine does not
//! handle come out as `Unrecognized`.

use std::{fmt, fs, path::Path};

use alloy::{
    json_abi::JsonAbi,
    primitives::{LogData, B256},
    sol_types::SolEvent,
};
use rustc_hash::FxHashMap;

use crate::{
    abis::{LiquidityAdded, LiquidityRemoved, PairCreated, Swap},
    error::DecodeError,
    worker::block_source::RawEvent,
};

const PAIR_ABI: &str = include_str!("../../abis/pair.json");
const FACTORY_ABI: &str = include_str!("../../abis/factory.json");

/// Events the engine acts on. Anything else a description declares is
/// decoded as `Unrecognized` and never requested from the block source.
const HANDLED_PAIR_EVENTS: [&str; 3] = ["Swap", "LiquidityAdded", "LiquidityRemoved"];
const HANDLED_FACTORY_EVENTS: [&str; 1] = ["PairCreated"];

/// Logical service a log originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractKind {
    Pair,
    Factory,
}

impl ContractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractKind::Pair => "pair",
            ContractKind::Factory => "factory",
        }
    }

    fn file_name(&self) -> &'static str {
        match self {
            ContractKind::Pair => "pair.json",
            ContractKind::Factory => "factory.json",
        }
    }
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event selector → method name table for one contract kind.
#[derive(Debug, Clone)]
pub struct InterfaceDescription {
    kind: ContractKind,
    events: FxHashMap<B256, String>,
}

impl InterfaceDescription {
    pub fn from_json(kind: ContractKind, json: &str) -> Result<Self, DecodeError> {
        let abi: JsonAbi = serde_json::from_str(json)
            .map_err(|e| DecodeError::InvalidInterface(format!("{}: {}", kind, e)))?;

        let events: FxHashMap<B256, String> = abi
            .events()
            .filter(|e| !e.anonymous)
            .map(|e| (e.selector(), e.name.clone()))
            .collect();

        if events.is_empty() {
            return Err(DecodeError::InvalidInterface(format!(
                "{} interface declares no events",
                kind
            )));
        }

        Ok(Self { kind, events })
    }

    pub fn load(kind: ContractKind, path: &Path) -> Result<Self, DecodeError> {
        let json = fs::read_to_string(path).map_err(|e| {
            DecodeError::InvalidInterface(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json(kind, &json)
    }

    /// Description compiled into the binary.
    pub fn builtin(kind: ContractKind) -> Result<Self, DecodeError> {
        match kind {
            ContractKind::Pair => Self::from_json(kind, PAIR_ABI),
            ContractKind::Factory => Self::from_json(kind, FACTORY_ABI),
        }
    }

    pub fn kind(&self) -> ContractKind {
        self.kind
    }

    pub fn method(&self, selector: &B256) -> Option<&str> {
        self.events.get(selector).map(String::as_str)
    }

    /// Selectors of the named events that this description declares.
    pub fn selectors_for<'a>(&'a self, methods: &'a [&str]) -> impl Iterator<Item = &'a B256> {
        self.events
            .iter()
            .filter(move |(_, name)| methods.contains(&name.as_str()))
            .map(|(selector, _)| selector)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PairEvent {
    Swap(Swap),
    LiquidityAdded(LiquidityAdded),
    LiquidityRemoved(LiquidityRemoved),
    /// Declared by the interface but not handled by the engine.
    Unrecognized { method: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FactoryEvent {
    PairCreated(PairCreated),
    Unrecognized { method: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Pair(PairEvent),
    Factory(FactoryEvent),
}

impl DecodedEvent {
    pub fn service(&self) -> ContractKind {
        match self {
            DecodedEvent::Pair(_) => ContractKind::Pair,
            DecodedEvent::Factory(_) => ContractKind::Factory,
        }
    }

    pub fn method(&self) -> &str {
        match self {
            DecodedEvent::Pair(PairEvent::Swap(_)) => "Swap",
            DecodedEvent::Pair(PairEvent::LiquidityAdded(_)) => "LiquidityAdded",
            DecodedEvent::Pair(PairEvent::LiquidityRemoved(_)) => "LiquidityRemoved",
            DecodedEvent::Factory(FactoryEvent::PairCreated(_)) => "PairCreated",
            DecodedEvent::Pair(PairEvent::Unrecognized { method })
            | DecodedEvent::Factory(FactoryEvent::Unrecognized { method }) => method,
        }
    }
}

/// Stateless decoder over the pair and factory interface descriptions.
#[derive(Debug, Clone)]
pub struct Decoder {
    pair: InterfaceDescription,
    factory: InterfaceDescription,
}

impl Decoder {
    pub fn new(pair: InterfaceDescription, factory: InterfaceDescription) -> Self {
        Self { pair, factory }
    }

    pub fn builtin() -> Result<Self, DecodeError> {
        Ok(Self::new(
            InterfaceDescription::builtin(ContractKind::Pair)?,
            InterfaceDescription::builtin(ContractKind::Factory)?,
        ))
    }

    /// Load `pair.json` and `factory.json` from `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, DecodeError> {
        Ok(Self::new(
            InterfaceDescription::load(ContractKind::Pair, &dir.join(ContractKind::Pair.file_name()))?,
            InterfaceDescription::load(
                ContractKind::Factory,
                &dir.join(ContractKind::Factory.file_name()),
            )?,
        ))
    }

    /// Topic0 of every handled event, for source-side filtering.
    pub fn selectors(&self) -> Vec<B256> {
        let mut selectors: Vec<B256> = self
            .pair
            .selectors_for(&HANDLED_PAIR_EVENTS)
            .chain(self.factory.selectors_for(&HANDLED_FACTORY_EVENTS))
            .copied()
            .collect();
        selectors.sort();
        selectors.dedup();
        selectors
    }

    /// Method name a log's selector maps to in either description.
    pub fn method_of(&self, event: &RawEvent) -> Option<&str> {
        let topic0 = event.topics.first()?;
        self.pair
            .method(topic0)
            .or_else(|| self.factory.method(topic0))
    }

    /// Decode a log emitted by a contract of `kind`.
    ///
    /// `Ok(None)` when the log is not a service event at all (no topics, or
    /// dropped by a reorg). Unknown selectors and malformed payloads are
    /// errors; the caller decides whether to skip or abort.
    pub fn decode(
        &self,
        kind: ContractKind,
        event: &RawEvent,
    ) -> Result<Option<DecodedEvent>, DecodeError> {
        if event.removed {
            return Ok(None);
        }
        let Some(topic0) = event.topics.first() else {
            return Ok(None);
        };

        let description = match kind {
            ContractKind::Pair => &self.pair,
            ContractKind::Factory => &self.factory,
        };

        let method = description
            .method(topic0)
            .ok_or_else(|| DecodeError::UnknownSelector {
                service: kind.as_str(),
                selector: topic0.to_string(),
            })?;

        let log_data = LogData::new_unchecked(event.topics.clone(), event.data.clone());

        let decoded = match (kind, method) {
            (ContractKind::Pair, "Swap") => {
                DecodedEvent::Pair(PairEvent::Swap(decode_as::<Swap>(method, &log_data)?))
            },
            (ContractKind::Pair, "LiquidityAdded") => DecodedEvent::Pair(
                PairEvent::LiquidityAdded(decode_as::<LiquidityAdded>(method, &log_data)?),
            ),
            (ContractKind::Pair, "LiquidityRemoved") => DecodedEvent::Pair(
                PairEvent::LiquidityRemoved(decode_as::<LiquidityRemoved>(method, &log_data)?),
            ),
            (ContractKind::Factory, "PairCreated") => DecodedEvent::Factory(
                FactoryEvent::PairCreated(decode_as::<PairCreated>(method, &log_data)?),
            ),
            (ContractKind::Pair, _) => DecodedEvent::Pair(PairEvent::Unrecognized {
                method: method.to_string(),
            }),
            (ContractKind::Factory, _) => DecodedEvent::Factory(FactoryEvent::Unrecognized {
                method: method.to_string(),
            }),
        };

        Ok(Some(decoded))
    }
}

fn decode_as<E: SolEvent>(method: &str, log_data: &LogData) -> Result<E, DecodeError> {
    E::decode_log_data(log_data).map_err(|source| DecodeError::Malformed {
        method: method.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, Bytes, U256};

    fn raw(log: LogData) -> RawEvent {
        RawEvent {
            address: "0x00000000000000000000000000000000000000aa".into(),
            topics: log.topics().to_vec(),
            data: log.data.clone(),
            block_number: 7,
            tx_hash: "0x01".into(),
            log_index: 0,
            removed: false,
        }
    }

    fn swap() -> Swap {
        Swap {
            sender: Address::repeat_byte(0x01),
            zeroForOne: true,
            amountIn: U256::from(1_000u64),
            amountOut: U256::from(2_000u64),
            to: Address::repeat_byte(0x02),
        }
    }

    #[test]
    fn test_builtin_descriptions_match_bindings() {
        let decoder = Decoder::builtin().unwrap();
        assert_eq!(decoder.pair.method(&Swap::SIGNATURE_HASH), Some("Swap"));
        assert_eq!(
            decoder.pair.method(&LiquidityRemoved::SIGNATURE_HASH),
            Some("LiquidityRemoved")
        );
        assert_eq!(
            decoder.factory.method(&PairCreated::SIGNATURE_HASH),
            Some("PairCreated")
        );
    }

    #[test]
    fn test_selectors_cover_only_handled_events() {
        let decoder = Decoder::builtin().unwrap();
        let mut expected = vec![
            Swap::SIGNATURE_HASH,
            LiquidityAdded::SIGNATURE_HASH,
            LiquidityRemoved::SIGNATURE_HASH,
            PairCreated::SIGNATURE_HASH,
        ];
        expected.sort();
        assert_eq!(decoder.selectors(), expected);

        // Declared by the pair description, but not requested
        let declared: Vec<&String> = decoder.pair.events.values().collect();
        assert!(declared.iter().any(|name| name.as_str() == "Transfer"));
        assert!(declared.iter().any(|name| name.as_str() == "Sync"));
    }

    #[test]
    fn test_decode_swap() {
        let decoder = Decoder::builtin().unwrap();
        let decoded = decoder
            .decode(ContractKind::Pair, &raw(swap().encode_log_data()))
            .unwrap()
            .unwrap();

        assert_eq!(decoded.service(), ContractKind::Pair);
        assert_eq!(decoded.method(), "Swap");
        assert_eq!(decoded, DecodedEvent::Pair(PairEvent::Swap(swap())));
    }

    #[test]
    fn test_decode_pair_created() {
        let decoder = Decoder::builtin().unwrap();
        let event = PairCreated {
            token0: Address::repeat_byte(0x0a),
            token1: Address::repeat_byte(0x0b),
            pair: Address::repeat_byte(0xcc),
            pairCount: U256::from(1u64),
        };
        let decoded = decoder
            .decode(ContractKind::Factory, &raw(event.encode_log_data()))
            .unwrap();
        assert_eq!(
            decoded,
            Some(DecodedEvent::Factory(FactoryEvent::PairCreated(event)))
        );
    }

    #[test]
    fn test_known_but_unhandled_method_is_unrecognized() {
        let decoder = Decoder::builtin().unwrap();
        let sync_selector = decoder
            .pair
            .events
            .iter()
            .find(|(_, name)| name.as_str() == "Sync")
            .map(|(selector, _)| *selector)
            .unwrap();

        let log = LogData::new_unchecked(vec![sync_selector], Bytes::from(vec![0u8; 64]));
        let decoded = decoder.decode(ContractKind::Pair, &raw(log)).unwrap().unwrap();
        assert_eq!(
            decoded,
            DecodedEvent::Pair(PairEvent::Unrecognized {
                method: "Sync".into()
            })
        );
    }

    #[test]
    fn test_unknown_selector_fails() {
        let decoder = Decoder::builtin().unwrap();
        let log = LogData::new_unchecked(vec![B256::repeat_byte(0x42)], Bytes::new());
        let err = decoder.decode(ContractKind::Pair, &raw(log)).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownSelector { service: "pair", .. }));
    }

    #[test]
    fn test_wrong_kind_fails() {
        let decoder = Decoder::builtin().unwrap();
        let err = decoder
            .decode(ContractKind::Factory, &raw(swap().encode_log_data()))
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnknownSelector { service: "factory", .. }));
    }

    #[test]
    fn test_malformed_payload_fails() {
        let decoder = Decoder::builtin().unwrap();
        let mut event = raw(swap().encode_log_data());
        event.data = Bytes::from(vec![0u8; 5]);

        let err = decoder.decode(ContractKind::Pair, &event).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { ref method, .. } if method == "Swap"));
    }

    #[test]
    fn test_non_service_logs_are_ignored() {
        let decoder = Decoder::builtin().unwrap();
        let mut event = raw(swap().encode_log_data());
        event.removed = true;
        assert_eq!(decoder.decode(ContractKind::Pair, &event).unwrap(), None);

        let empty = raw(LogData::new_unchecked(vec![], Bytes::new()));
        assert_eq!(decoder.decode(ContractKind::Pair, &empty).unwrap(), None);
    }

    #[test]
    fn test_invalid_interface() {
        assert!(matches!(
            InterfaceDescription::from_json(ContractKind::Pair, "{not json"),
            Err(DecodeError::InvalidInterface(_))
        ));
        assert!(matches!(
            InterfaceDescription::from_json(ContractKind::Pair, "[]"),
            Err(DecodeError::InvalidInterface(_))
        ));
    }
}
