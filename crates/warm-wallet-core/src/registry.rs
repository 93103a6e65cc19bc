// Suggester discovery from the on-chain registry contract.
//
// `ContractRegistry` issues read-only `eth_call`s over JSON-RPC and decodes
// the ABI-encoded results. `read_suggesters` turns the raw registry rows
// into the filtered, canonicalized suggester list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::identity::{address_from_bytes, canonical_address, keccak256, AddressError};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("return data truncated: need {needed} bytes, have {len}")]
    Truncated { needed: usize, len: usize },

    #[error("integer does not fit in 64 bits")]
    Overflow,

    #[error("string is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("return data is not hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("registry RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("registry RPC response had neither result nor error")]
    EmptyResponse,

    #[error("failed to decode registry response: {0}")]
    Abi(#[from] AbiError),

    #[error("registry returned an invalid address: {0}")]
    Address(#[from] AddressError),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One raw registry row, as returned by `suggesterInfoByIndex`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggesterInfo {
    pub address: String,
    pub url: String,
    pub name: String,
    pub bio: String,
}

/// A remote suggester service. `address` is always canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggester {
    pub address: String,
    pub url: String,
    pub name: String,
    pub bio: String,
}

/// The ordered suggester list plus its address index.
#[derive(Debug, Clone, Default)]
pub struct SuggesterBook {
    list: Vec<Suggester>,
    by_address: HashMap<String, Suggester>,
}

impl SuggesterBook {
    pub fn new(list: Vec<Suggester>) -> Self {
        let mut by_address = HashMap::with_capacity(list.len());
        for suggester in &list {
            by_address.insert(suggester.address.clone(), suggester.clone());
        }
        Self { list, by_address }
    }

    /// Look a suggester up by a raw (not necessarily canonical) address.
    pub fn get(&self, raw_address: &str) -> Option<&Suggester> {
        let address = canonical_address(raw_address).ok()?;
        self.by_address.get(&address)
    }

    pub fn list(&self) -> &[Suggester] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Registry collaborator
// ---------------------------------------------------------------------------

/// Read access to the suggester registry.
#[async_trait]
pub trait SuggesterRegistry: Send + Sync {
    async fn suggester_count(&self) -> Result<u64, RegistryError>;

    async fn suggester_info_by_index(&self, index: u64) -> Result<SuggesterInfo, RegistryError>;
}

/// Read the full suggester list.
///
/// All index reads run concurrently and any single failure fails the whole
/// call. Index 0 is reserved and always dropped; rows with an empty url are
/// filtered out.
pub async fn read_suggesters(
    registry: &dyn SuggesterRegistry,
) -> Result<Vec<Suggester>, RegistryError> {
    let count = registry.suggester_count().await?;
    debug!(count, "registry suggester count");

    let rows = try_join_all((0..count).map(|i| registry.suggester_info_by_index(i))).await?;

    let mut suggesters = Vec::with_capacity(rows.len().saturating_sub(1));
    for row in rows.into_iter().skip(1) {
        let address = canonical_address(&row.address)?;
        if row.url.is_empty() {
            debug!(%address, "skipping suggester without endpoint");
            continue;
        }
        suggesters.push(Suggester {
            address,
            url: row.url,
            name: row.name,
            bio: row.bio,
        });
    }

    info!(count = suggesters.len(), "loaded suggesters from registry");
    Ok(suggesters)
}

// ---------------------------------------------------------------------------
// ContractRegistry
// ---------------------------------------------------------------------------

const SUGGESTER_COUNT_SIG: &str = "suggesterCount()";
const SUGGESTER_INFO_SIG: &str = "suggesterInfoByIndex(uint256)";

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<String>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Registry backed by a deployed contract, read through an Ethereum
/// JSON-RPC endpoint.
pub struct ContractRegistry {
    http: reqwest::Client,
    rpc_url: String,
    contract_address: String,
    next_id: AtomicU64,
}

impl ContractRegistry {
    pub fn new(rpc_url: String, contract_address: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            rpc_url,
            contract_address,
            next_id: AtomicU64::new(1),
        }
    }

    async fn eth_call(&self, calldata: Vec<u8>) -> Result<Vec<u8>, RegistryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "eth_call",
            "params": [
                { "to": self.contract_address, "data": format!("0x{}", hex::encode(calldata)) },
                "latest"
            ]
        });

        let response: JsonRpcResponse = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(RegistryError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        let result = response.result.ok_or(RegistryError::EmptyResponse)?;
        let digits = result.strip_prefix("0x").unwrap_or(&result);
        Ok(hex::decode(digits).map_err(AbiError::from)?)
    }
}

#[async_trait]
impl SuggesterRegistry for ContractRegistry {
    async fn suggester_count(&self) -> Result<u64, RegistryError> {
        let data = self.eth_call(selector(SUGGESTER_COUNT_SIG).to_vec()).await?;
        Ok(decode_uint(&data, 0)?)
    }

    async fn suggester_info_by_index(&self, index: u64) -> Result<SuggesterInfo, RegistryError> {
        let mut calldata = selector(SUGGESTER_INFO_SIG).to_vec();
        calldata.extend_from_slice(&encode_uint(index));
        let data = self.eth_call(calldata).await?;
        Ok(decode_suggester_info(&data)?)
    }
}

// ---------------------------------------------------------------------------
// ABI helpers
// ---------------------------------------------------------------------------

const WORD: usize = 32;

/// First four bytes of keccak256 of the function signature.
pub(crate) fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub(crate) fn encode_uint(value: u64) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&value.to_be_bytes());
    word
}

fn word_at(data: &[u8], offset: usize) -> Result<&[u8], AbiError> {
    let end = offset.checked_add(WORD).ok_or(AbiError::Overflow)?;
    data.get(offset..end).ok_or(AbiError::Truncated {
        needed: end,
        len: data.len(),
    })
}

pub(crate) fn decode_uint(data: &[u8], offset: usize) -> Result<u64, AbiError> {
    let word = word_at(data, offset)?;
    if word[..WORD - 8].iter().any(|&b| b != 0) {
        return Err(AbiError::Overflow);
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&word[WORD - 8..]);
    Ok(u64::from_be_bytes(bytes))
}

fn decode_address(data: &[u8], offset: usize) -> Result<String, AbiError> {
    let word = word_at(data, offset)?;
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&word[12..]);
    Ok(address_from_bytes(&bytes))
}

/// Decode a dynamic `string` whose head word at `head_offset` points at its
/// length-prefixed tail.
fn decode_string(data: &[u8], head_offset: usize) -> Result<String, AbiError> {
    let tail = usize::try_from(decode_uint(data, head_offset)?).map_err(|_| AbiError::Overflow)?;
    let len = usize::try_from(decode_uint(data, tail)?).map_err(|_| AbiError::Overflow)?;
    let start = tail + WORD;
    let end = start.checked_add(len).ok_or(AbiError::Overflow)?;
    let bytes = data.get(start..end).ok_or(AbiError::Truncated {
        needed: end,
        len: data.len(),
    })?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Decode `(address, string url, string name, string bio)`.
pub(crate) fn decode_suggester_info(data: &[u8]) -> Result<SuggesterInfo, AbiError> {
    Ok(SuggesterInfo {
        address: decode_address(data, 0)?,
        url: decode_string(data, WORD)?,
        name: decode_string(data, 2 * WORD)?,
        bio: decode_string(data, 3 * WORD)?,
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
