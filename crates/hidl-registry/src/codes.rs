// Author: Lukas Bower
//! Reserved IBase transaction codes shared by every HIDL object.

/// Pack four bytes into a transaction code, most significant first.
#[must_use]
pub const fn b_pack_chars(c1: u8, c2: u8, c3: u8, c4: u8) -> u32 {
    ((c1 as u32) << 24) | ((c2 as u32) << 16) | ((c3 as u32) << 8) | (c4 as u32)
}

/// Liveness check; replies with an empty payload.
pub const PING: u32 = b_pack_chars(0x0f, b'P', b'N', b'G');
/// Returns the interface chain.
pub const INTERFACE_CHAIN: u32 = b_pack_chars(0x0f, b'C', b'H', b'N');
/// Returns the most-derived interface descriptor.
pub const INTERFACE_DESCRIPTOR: u32 = b_pack_chars(0x0f, b'D', b'S', b'C');
/// Notification that system properties changed.
pub const SYSPROPS_CHANGED: u32 = b_pack_chars(0x0f, b'S', b'Y', b'S');

/// Short label used in log lines.
#[must_use]
pub const fn label(code: u32) -> &'static str {
    match code {
        PING => "ping",
        INTERFACE_CHAIN => "interfaceChain",
        INTERFACE_DESCRIPTOR => "interfaceDescriptor",
        SYSPROPS_CHANGED => "notifySyspropsChanged",
        _ => "user",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_big_endian() {
        assert_eq!(PING, 0x0f50_4e47);
        assert_eq!(label(INTERFACE_CHAIN), "interfaceChain");
        assert_eq!(label(1), "user");
    }
}
