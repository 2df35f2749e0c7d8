//! Extraction rules: capabilities that derive knowledge-graph triplets from
//! content. Rules may also emit derived content items that re-enter the
//! processing queue (a block yields its transactions).

use crate::dkg::content::Content;
use crate::dkg::knowledge_graph::Triplet;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct RuleOutput {
    pub triplets: Vec<Triplet>,
    pub derived: Vec<Content>,
}

pub trait Rule: Send + Sync {
    fn name(&self) -> &'static [u8];

    fn apply(&self, content: &Content) -> RuleOutput;
}

/// The rules a node runs over every pending content item.
#[derive(Default, Clone)]
pub struct RuleRegistry {
    rules: Vec<Arc<dyn Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: Arc<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn get_rule(&self, name: &[u8]) -> Option<Arc<dyn Rule>> {
        self.rules.iter().find(|r| r.name() == name).cloned()
    }

    pub fn all_rules(&self) -> Vec<Arc<dyn Rule>> {
        self.rules.clone()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Emits one fixed edge per content item. Useful for tests.
#[derive(Debug, Default)]
pub struct DummyRule;

impl Rule for DummyRule {
    fn name(&self) -> &'static [u8] {
        b"DUMMY"
    }

    fn apply(&self, content: &Content) -> RuleOutput {
        RuleOutput {
            triplets: vec![Triplet::new(
                hex::encode(&content.identifier).into_bytes(),
                b"a".as_slice(),
                b"b".as_slice(),
            )],
            derived: Vec::new(),
        }
    }
}

fn scalar_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => Some(s.as_bytes().to_vec()),
        Value::Number(n) => Some(n.to_string().into_bytes()),
        Value::Bool(b) => Some(b.to_string().into_bytes()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// One triplet per scalar block attribute; every transaction in the block is
/// enqueued as derived content keyed by its hash.
#[derive(Debug, Default)]
pub struct EthereumBlockRule;

impl Rule for EthereumBlockRule {
    fn name(&self) -> &'static [u8] {
        b"ETHBLK"
    }

    fn apply(&self, content: &Content) -> RuleOutput {
        let mut out = RuleOutput::default();
        let Ok(Value::Object(block)) = serde_json::from_slice::<Value>(&content.data) else {
            return out;
        };
        if !block.contains_key("miner") {
            // Not a block.
            return out;
        }

        for (key, value) in &block {
            if key == "hash" || key == "transactions" {
                continue;
            }
            let Some(tail) = scalar_bytes(value) else {
                continue;
            };
            out.triplets.push(Triplet::new(
                content.identifier.clone(),
                key.as_bytes(),
                tail,
            ));
        }

        if let Some(Value::Array(transactions)) = block.get("transactions") {
            for tx in transactions {
                let Some(hash) = tx.get("hash").and_then(Value::as_str) else {
                    continue;
                };
                let Ok(identifier) = hex::decode(hash.trim_start_matches("0x")) else {
                    continue;
                };
                let Ok(data) = serde_json::to_vec(tx) else {
                    continue;
                };
                out.derived.push(Content::new(identifier, data));
            }
        }
        out
    }
}

/// One triplet per scalar transaction attribute. Hex-string values are
/// stored as their decoded bytes.
#[derive(Debug, Default)]
pub struct EthereumTransactionRule;

impl Rule for EthereumTransactionRule {
    fn name(&self) -> &'static [u8] {
        b"ETHTX"
    }

    fn apply(&self, content: &Content) -> RuleOutput {
        let mut out = RuleOutput::default();
        let Ok(Value::Object(tx)) = serde_json::from_slice::<Value>(&content.data) else {
            return out;
        };
        if !tx.contains_key("from") {
            // Not a transaction.
            return out;
        }

        for (key, value) in &tx {
            if key == "hash" || key == "accessList" || key == "input" {
                continue;
            }
            let tail = match value {
                Value::String(s) if s.starts_with("0x") => match hex::decode(&s[2..]) {
                    Ok(bytes) => Some(bytes),
                    Err(_) => scalar_bytes(value),
                },
                other => scalar_bytes(other),
            };
            let Some(tail) = tail else { continue };
            out.triplets.push(Triplet::new(
                content.identifier.clone(),
                key.as_bytes(),
                tail,
            ));
        }
        out
    }
}
