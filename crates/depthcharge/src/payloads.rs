//! Built-in executable payloads, deployed with a memory writer and invoked
//! through the target's `go` command.
//!
//! Payloads follow U-Boot's "standalone application" convention: invoked at
//! their load address with the standard calling convention, returning a
//! word in the first argument/return register.

/// Returns the value of the register selected by an identifier byte passed
/// as a command argument.
pub const RETURN_REGISTER: &str = "RETURN_REGISTER";

/// Returns the memory word at the address passed as a command argument.
pub const RETURN_MEMORY_WORD: &str = "RETURN_MEMORY_WORD";

/// Streams a memory region to the console as raw bytes, bracketed by start
/// and end sentinels, using console output routines from the U-Boot jump
/// table.
pub const READ_MEMORY: &str = "READ_MEMORY";

pub(crate) struct BuiltinPayload {
    pub name: &'static str,
    pub arch: &'static str,
    pub data: &'static [u8],
}

// 32-bit ARM stubs, assembled little-endian.

// ldr r0, [r0]; bx lr
const ARM_RETURN_MEMORY_WORD: &[u8] = &[
    0x00, 0x00, 0x90, 0xe5, //
    0x1e, 0xff, 0x2f, 0xe1,
];

// Loads the identifier character from argv[1], indexes a register spill
// frame pushed on entry, and returns the selected value.
const ARM_RETURN_REGISTER: &[u8] = &[
    0x0f, 0x00, 0x2d, 0xe9, // push  {r0-r3}
    0xf0, 0x4f, 0x2d, 0xe9, // push  {r4-r11, lr}
    0x04, 0x10, 0x91, 0xe5, // ldr   r1, [r1, #4]
    0x00, 0x20, 0xd1, 0xe5, // ldrb  r2, [r1]
    0x60, 0x20, 0x42, 0xe2, // sub   r2, r2, #0x60
    0x0d, 0x30, 0xa0, 0xe1, // mov   r3, sp
    0x02, 0x01, 0x93, 0xe7, // ldr   r0, [r3, r2, lsl #2]
    0xf0, 0x4f, 0xbd, 0xe8, // pop   {r4-r11, lr}
    0x10, 0xd0, 0x8d, 0xe2, // add   sp, sp, #16
    0x1e, 0xff, 0x2f, 0xe1, // bx    lr
];

// Emits a start sentinel via the jump table's puts(), waits for a character,
// streams the requested region with putc(), and emits the end sentinel.
// Arguments: jump table address, source address, length.
const ARM_READ_MEMORY: &[u8] = &[
    0x30, 0x40, 0x2d, 0xe9, // push  {r4, r5, lr}
    0x00, 0x40, 0xa0, 0xe1, // mov   r4, r0
    0x01, 0x50, 0xa0, 0xe1, // mov   r5, r1
    0x38, 0x00, 0x8f, 0xe2, // adr   r0, start_sentinel
    0x10, 0x30, 0x94, 0xe5, // ldr   r3, [r4, #0x10]
    0x33, 0xff, 0x2f, 0xe1, // blx   r3              ; puts
    0x04, 0x30, 0x94, 0xe5, // ldr   r3, [r4, #4]
    0x33, 0xff, 0x2f, 0xe1, // blx   r3              ; getc
    0x00, 0x00, 0xd5, 0xe4, // ldrb  r0, [r5], #1
    0x0c, 0x30, 0x94, 0xe5, // ldr   r3, [r4, #0xc]
    0x33, 0xff, 0x2f, 0xe1, // blx   r3              ; putc
    0x01, 0x20, 0x52, 0xe2, // subs  r2, r2, #1
    0xfa, 0xff, 0xff, 0x1a, // bne   stream_loop
    0x1c, 0x00, 0x8f, 0xe2, // adr   r0, end_sentinel
    0x10, 0x30, 0x94, 0xe5, // ldr   r3, [r4, #0x10]
    0x33, 0xff, 0x2f, 0xe1, // blx   r3              ; puts
    0x00, 0x00, 0xa0, 0xe3, // mov   r0, #0
    0x30, 0x80, 0xbd, 0xe8, // pop   {r4, r5, pc}
    // "-:[START]:-\0"
    0x2d, 0x3a, 0x5b, 0x53, 0x54, 0x41, 0x52, 0x54, 0x5d, 0x3a, 0x2d, 0x00,
    // "-:[|END|]:-\0"
    0x2d, 0x3a, 0x5b, 0x7c, 0x45, 0x4e, 0x44, 0x7c, 0x5d, 0x3a, 0x2d, 0x00,
];

// AArch64 stubs.

// ldr x0, [x0]; ret
const AARCH64_RETURN_MEMORY_WORD: &[u8] = &[
    0x00, 0x00, 0x40, 0xf9, //
    0xc0, 0x03, 0x5f, 0xd6,
];

const AARCH64_RETURN_REGISTER: &[u8] = &[
    0xfd, 0x7b, 0xbf, 0xa9, // stp   x29, x30, [sp, #-16]!
    0xe0, 0x07, 0xbf, 0xa9, // stp   x0, x1, [sp, #-16]!
    0x21, 0x04, 0x40, 0xf9, // ldr   x1, [x1, #8]
    0x22, 0x00, 0x40, 0x39, // ldrb  w2, [x1]
    0x42, 0x80, 0x01, 0x51, // sub   w2, w2, #0x60
    0xe3, 0x03, 0x00, 0x91, // mov   x3, sp
    0x60, 0x78, 0x62, 0xf8, // ldr   x0, [x3, x2, lsl #3]
    0xff, 0x43, 0x00, 0x91, // add   sp, sp, #16
    0xfd, 0x7b, 0xc1, 0xa8, // ldp   x29, x30, [sp], #16
    0xc0, 0x03, 0x5f, 0xd6, // ret
];

const AARCH64_READ_MEMORY: &[u8] = &[
    0xf4, 0x4f, 0xbf, 0xa9, // stp   x20, x19, [sp, #-16]!
    0xfd, 0x7b, 0xbf, 0xa9, // stp   x29, x30, [sp, #-16]!
    0xf4, 0x03, 0x00, 0xaa, // mov   x20, x0
    0xf3, 0x03, 0x01, 0xaa, // mov   x19, x1
    0x60, 0x02, 0x00, 0x10, // adr   x0, start_sentinel
    0x83, 0x12, 0x40, 0xf9, // ldr   x3, [x20, #0x20]
    0x60, 0x00, 0x3f, 0xd6, // blr   x3              ; puts
    0x83, 0x06, 0x40, 0xf9, // ldr   x3, [x20, #8]
    0x60, 0x00, 0x3f, 0xd6, // blr   x3              ; getc
    0x60, 0x16, 0x40, 0x38, // ldrb  w0, [x19], #1
    0x83, 0x0e, 0x40, 0xf9, // ldr   x3, [x20, #0x18]
    0x60, 0x00, 0x3f, 0xd6, // blr   x3              ; putc
    0x42, 0x04, 0x00, 0xf1, // subs  x2, x2, #1
    0xa1, 0xff, 0xff, 0x54, // b.ne  stream_loop
    0x20, 0x01, 0x00, 0x10, // adr   x0, end_sentinel
    0x83, 0x12, 0x40, 0xf9, // ldr   x3, [x20, #0x20]
    0x60, 0x00, 0x3f, 0xd6, // blr   x3              ; puts
    0x00, 0x00, 0x80, 0xd2, // mov   x0, #0
    0xfd, 0x7b, 0xc1, 0xa8, // ldp   x29, x30, [sp], #16
    0xf4, 0x4f, 0xc1, 0xa8, // ldp   x20, x19, [sp], #16
    0xc0, 0x03, 0x5f, 0xd6, // ret
    // "-:[START]:-\0"
    0x2d, 0x3a, 0x5b, 0x53, 0x54, 0x41, 0x52, 0x54, 0x5d, 0x3a, 0x2d, 0x00,
    // "-:[|END|]:-\0"
    0x2d, 0x3a, 0x5b, 0x7c, 0x45, 0x4e, 0x44, 0x7c, 0x5d, 0x3a, 0x2d, 0x00,
];

const BUILTINS: &[BuiltinPayload] = &[
    BuiltinPayload {
        name: RETURN_MEMORY_WORD,
        arch: "ARM",
        data: ARM_RETURN_MEMORY_WORD,
    },
    BuiltinPayload {
        name: RETURN_REGISTER,
        arch: "ARM",
        data: ARM_RETURN_REGISTER,
    },
    BuiltinPayload {
        name: READ_MEMORY,
        arch: "ARM",
        data: ARM_READ_MEMORY,
    },
    BuiltinPayload {
        name: RETURN_MEMORY_WORD,
        arch: "AARCH64",
        data: AARCH64_RETURN_MEMORY_WORD,
    },
    BuiltinPayload {
        name: RETURN_REGISTER,
        arch: "AARCH64",
        data: AARCH64_RETURN_REGISTER,
    },
    BuiltinPayload {
        name: READ_MEMORY,
        arch: "AARCH64",
        data: AARCH64_READ_MEMORY,
    },
];

/// Names of all built-in payloads, whether or not the architecture has an
/// implementation.
pub fn names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = BUILTINS.iter().map(|p| p.name).collect();
    names.sort_unstable();
    names.dedup();
    names
}

/// Built-in payloads implemented for the given architecture.
pub(crate) fn builtins(arch_name: &str) -> Vec<&'static BuiltinPayload> {
    BUILTINS
        .iter()
        .filter(|p| p.arch.eq_ignore_ascii_case(arch_name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_per_arch() {
        let arm = builtins("arm");
        assert_eq!(arm.len(), 3);
        assert!(arm.iter().any(|p| p.name == READ_MEMORY));

        assert!(builtins("generic").is_empty());
    }

    #[test]
    fn test_payload_sentinels_embedded() {
        for payload in builtins("ARM").iter().chain(builtins("AARCH64").iter()) {
            if payload.name == READ_MEMORY {
                let data = payload.data;
                assert!(
                    data.windows(11).any(|w| w == b"-:[START]:-"),
                    "missing start sentinel"
                );
                assert!(
                    data.windows(11).any(|w| w == b"-:[|END|]:-"),
                    "missing end sentinel"
                );
            }
        }
    }
}
