//! Sync protocol decoding.
//!
//! The subset of the downstream wire protocol the core consumes: the
//! `connected` greeting, the three-part poke sequence
//! (`pokeStart`/`pokePart`/`pokeEnd`), push responses, and server error
//! frames. Messages are `[tag, body]` JSON arrays.
//!
//! [`PokeDecoder`] enforces the poke lifecycle strictly: a part or end with
//! a mismatched poke ID, or an overlapping start, is a protocol error —
//! never silently absorbed.

use std::cell::RefCell;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{LiteTrickleError, ProtocolError};

// ── Wire codes ─────────────────────────────────────────────────────────────

/// Per-mutation error taxonomy.
pub const MUTATION_ERROR_APP: &str = "app";
pub const MUTATION_ERROR_ALREADY_PROCESSED: &str = "alreadyProcessed";
pub const MUTATION_ERROR_OOO: &str = "oooMutation";

/// Transport-level push error codes, all fatal.
pub const PUSH_ERROR_UNSUPPORTED_PUSH_VERSION: &str = "unsupportedPushVersion";
pub const PUSH_ERROR_UNSUPPORTED_SCHEMA_VERSION: &str = "unsupportedSchemaVersion";
pub const PUSH_ERROR_HTTP: &str = "http";
pub const PUSH_ERROR_PUSHER: &str = "zeroPusher";

// ── Message bodies ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connected {
    pub wsid: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeStart {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_cookie: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokePart {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    #[serde(
        rename = "lastMutationIDChanges",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_mutation_id_changes: Option<BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub got_queries_patch: Option<Json>,
    /// Remaining patch payload (row patches etc.), not interpreted here.
    #[serde(flatten)]
    pub patch: BTreeMap<String, Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeEnd {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

/// `{clientID, id}`: the server-side identity of an acknowledged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRef {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub id: u64,
}

/// Per-mutation result. The error taxonomy is `app`, `alreadyProcessed`,
/// `oooMutation`; unknown codes are preserved and treated as fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MutationResult {
    Error(MutationError),
    Ok(MutationOk),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationOk {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationError {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Json>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationAck {
    pub id: MutationRef,
    pub result: MutationResult,
}

/// A push response: per-mutation results, or a transport-level fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushResponse {
    Error(PushError),
    Ok(PushOk),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOk {
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub mutations: Vec<MutationAck>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushError {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        rename = "mutationIDs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub mutation_ids: Option<Vec<u64>>,
}

// ── Downstream envelope ────────────────────────────────────────────────────

/// One decoded downstream message.
#[derive(Debug, Clone, PartialEq)]
pub enum Downstream {
    Connected(Connected),
    PokeStart(PokeStart),
    PokePart(PokePart),
    PokeEnd(PokeEnd),
    PushResponse(PushResponse),
    Error(ProtocolError),
}

impl Downstream {
    /// Decode a `[tag, body]` frame. Unknown tags and malformed bodies are
    /// protocol errors.
    pub fn decode(value: &Json) -> Result<Downstream, LiteTrickleError> {
        let frame = value.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
            ProtocolError::client("malformedMessage", "downstream frame must be [tag, body]")
        })?;
        let tag = frame[0].as_str().ok_or_else(|| {
            ProtocolError::client("malformedMessage", "downstream tag must be a string")
        })?;
        let body = frame[1].clone();
        let decoded = match tag {
            "connected" => Downstream::Connected(from_body(tag, body)?),
            "pokeStart" => Downstream::PokeStart(from_body(tag, body)?),
            "pokePart" => Downstream::PokePart(from_body(tag, body)?),
            "pokeEnd" => Downstream::PokeEnd(from_body(tag, body)?),
            "pushResponse" => Downstream::PushResponse(from_body(tag, body)?),
            "error" => Downstream::Error(from_body(tag, body)?),
            other => {
                return Err(ProtocolError::client(
                    "unknownMessage",
                    &format!("unrecognised downstream tag `{other}`"),
                )
                .into());
            }
        };
        Ok(decoded)
    }

    /// Encode back to the `[tag, body]` wire form.
    pub fn encode(&self) -> Result<Json, LiteTrickleError> {
        let (tag, body) = match self {
            Downstream::Connected(b) => ("connected", to_body(b)?),
            Downstream::PokeStart(b) => ("pokeStart", to_body(b)?),
            Downstream::PokePart(b) => ("pokePart", to_body(b)?),
            Downstream::PokeEnd(b) => ("pokeEnd", to_body(b)?),
            Downstream::PushResponse(b) => ("pushResponse", to_body(b)?),
            Downstream::Error(b) => ("error", to_body(b)?),
        };
        Ok(Json::Array(vec![Json::String(tag.to_string()), body]))
    }
}

fn from_body<T: serde::de::DeserializeOwned>(
    tag: &str,
    body: Json,
) -> Result<T, LiteTrickleError> {
    serde_json::from_value(body).map_err(|e| {
        ProtocolError::client(
            "malformedMessage",
            &format!("bad `{tag}` body: {e}"),
        )
        .into()
    })
}

fn to_body<T: Serialize>(body: &T) -> Result<Json, LiteTrickleError> {
    serde_json::to_value(body).map_err(|e| {
        LiteTrickleError::Internal(format!("downstream body serialisation failed: {e}"))
    })
}

// ── Poke sequencing ────────────────────────────────────────────────────────

/// Everything accumulated over one complete poke.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedPoke {
    pub poke_id: String,
    pub base_cookie: Option<String>,
    pub cookie: Option<String>,
    pub last_mutation_id_changes: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct PokeInProgress {
    poke_id: String,
    base_cookie: Option<String>,
    lmid_changes: BTreeMap<String, u64>,
}

/// Validates the three-part poke sequencing and accumulates the parts.
#[derive(Debug, Default)]
pub struct PokeDecoder {
    current: RefCell<Option<PokeInProgress>>,
}

impl PokeDecoder {
    pub fn new() -> Self {
        PokeDecoder::default()
    }

    pub fn in_progress(&self) -> bool {
        self.current.borrow().is_some()
    }

    pub fn start(&self, msg: &PokeStart) -> Result<(), LiteTrickleError> {
        let mut current = self.current.borrow_mut();
        if let Some(open) = current.as_ref() {
            return Err(ProtocolError::client(
                "pokeOverlap",
                &format!(
                    "pokeStart {} while poke {} is still open",
                    msg.poke_id, open.poke_id
                ),
            )
            .into());
        }
        *current = Some(PokeInProgress {
            poke_id: msg.poke_id.clone(),
            base_cookie: msg.base_cookie.clone(),
            lmid_changes: BTreeMap::new(),
        });
        Ok(())
    }

    pub fn part(&self, msg: &PokePart) -> Result<(), LiteTrickleError> {
        let mut current = self.current.borrow_mut();
        let Some(open) = current.as_mut() else {
            return Err(
                ProtocolError::client("pokeMismatch", "pokePart without pokeStart").into(),
            );
        };
        if open.poke_id != msg.poke_id {
            return Err(ProtocolError::client(
                "pokeMismatch",
                &format!("pokePart {} inside poke {}", msg.poke_id, open.poke_id),
            )
            .into());
        }
        if let Some(changes) = &msg.last_mutation_id_changes {
            for (client_id, lmid) in changes {
                let entry = open.lmid_changes.entry(client_id.clone()).or_insert(0);
                *entry = (*entry).max(*lmid);
            }
        }
        Ok(())
    }

    pub fn end(&self, msg: &PokeEnd) -> Result<CompletedPoke, LiteTrickleError> {
        let mut current = self.current.borrow_mut();
        let Some(open) = current.take() else {
            return Err(ProtocolError::client("pokeMismatch", "pokeEnd without pokeStart").into());
        };
        if open.poke_id != msg.poke_id {
            let open_id = open.poke_id.clone();
            *current = Some(open);
            return Err(ProtocolError::client(
                "pokeMismatch",
                &format!("pokeEnd {} inside poke {}", msg.poke_id, open_id),
            )
            .into());
        }
        Ok(CompletedPoke {
            poke_id: open.poke_id,
            base_cookie: open.base_cookie,
            cookie: msg.cookie.clone(),
            last_mutation_id_changes: open.lmid_changes,
        })
    }
}
