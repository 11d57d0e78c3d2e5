// Author: Lukas Bower
//! Server-side stub installed as the hwbinder context object.

use std::rc::Rc;

use hidl_registry::{codes, HidlInterface, RegistryService};

use crate::transport::{DispatchError, DispatchTarget, Transaction};

/// Wraps the registry and answers the IBase calls every HIDL object serves.
pub struct ManagerStub {
    registry: Rc<dyn RegistryService>,
}

impl ManagerStub {
    /// Wrap `registry`.
    #[must_use]
    pub fn new(registry: Rc<dyn RegistryService>) -> Self {
        Self { registry }
    }
}

impl DispatchTarget for ManagerStub {
    fn on_transaction(&self, txn: &Transaction) -> Result<Vec<u8>, DispatchError> {
        log::debug!(
            "[stub] {label} one_way={one_way} len={len}",
            label = codes::label(txn.code),
            one_way = txn.one_way,
            len = txn.data.len()
        );
        match txn.code {
            codes::PING => Ok(Vec::new()),
            codes::INTERFACE_CHAIN => {
                let chain = self.registry.interface_chain();
                let names: Vec<&str> = chain.iter().collect();
                Ok(encode_strings(&names))
            }
            codes::INTERFACE_DESCRIPTOR => Ok(encode_strings(&[self.registry.descriptor()])),
            codes::SYSPROPS_CHANGED => Ok(Vec::new()),
            other => Err(DispatchError::UnknownCode(other)),
        }
    }
}

/// Encode strings as `[len u32 LE][utf8 bytes]` records.
#[must_use]
pub fn encode_strings<S: AsRef<str>>(items: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        let bytes = item.as_ref().as_bytes();
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
    }
    out
}

/// Decode records produced by [`encode_strings`].
pub fn decode_strings(mut bytes: &[u8]) -> Result<Vec<String>, DispatchError> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let (len, rest) = bytes
            .split_first_chunk::<4>()
            .ok_or(DispatchError::Malformed("truncated length"))?;
        let len = u32::from_le_bytes(*len) as usize;
        if rest.len() < len {
            return Err(DispatchError::Malformed("truncated string"));
        }
        let (text, rest) = rest.split_at(len);
        let text =
            std::str::from_utf8(text).map_err(|_| DispatchError::Malformed("invalid utf-8"))?;
        out.push(text.to_owned());
        bytes = rest;
    }
    Ok(out)
}
