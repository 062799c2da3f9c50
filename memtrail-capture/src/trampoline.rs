// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The return trampoline backing the ghost stack. A patched function
//! "returns" into `memtrail_trampoline`, which preserves the ABI's
//! return-value registers, asks the ghost stack for the real return
//! address, and jumps there. The asm must not touch any register that can
//! carry a return value.

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".text",
    ".balign 16",
    ".globl memtrail_trampoline",
    // The patched function's `ret` already popped its return address, so
    // rsp is 16-byte aligned on entry. Integer returns live in rax:rdx,
    // float/vector returns in xmm0:xmm1; all four survive the landing
    // call untouched.
    "memtrail_trampoline:",
    ".cfi_startproc",
    "sub rsp, 0x40",
    ".cfi_adjust_cfa_offset 0x40",
    "mov [rsp + 0x00], rax",
    "mov [rsp + 0x08], rdx",
    "movdqu [rsp + 0x10], xmm0",
    "movdqu [rsp + 0x20], xmm1",
    "lea rdi, [rsp + 0x40]",
    "call memtrail_trampoline_landing",
    "mov r11, rax",
    "mov rax, [rsp + 0x00]",
    "mov rdx, [rsp + 0x08]",
    "movdqu xmm0, [rsp + 0x10]",
    "movdqu xmm1, [rsp + 0x20]",
    "add rsp, 0x40",
    ".cfi_adjust_cfa_offset -0x40",
    "jmp r11",
    ".cfi_endproc",
);

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    ".text",
    ".balign 16",
    ".globl memtrail_trampoline",
    // Integer returns live in x0/x1 (x8 for indirect results), HFA and
    // vector returns in q0-q3. x30 is dead on entry: the patched `ret`
    // consumed it.
    "memtrail_trampoline:",
    ".cfi_startproc",
    "sub sp, sp, #0x70",
    ".cfi_adjust_cfa_offset 0x70",
    "stp x0, x1, [sp, #0x00]",
    "str x8, [sp, #0x10]",
    "stp q0, q1, [sp, #0x20]",
    "stp q2, q3, [sp, #0x40]",
    "add x0, sp, #0x70",
    "bl memtrail_trampoline_landing",
    "mov x30, x0",
    "ldp x0, x1, [sp, #0x00]",
    "ldr x8, [sp, #0x10]",
    "ldp q0, q1, [sp, #0x20]",
    "ldp q2, q3, [sp, #0x40]",
    "add sp, sp, #0x70",
    ".cfi_adjust_cfa_offset -0x70",
    // xpaclri: strip any pointer-authentication bits from the return
    // address; encoded in the hint space, a NOP before ARMv8.3.
    "hint #7",
    "ret",
    ".cfi_endproc",
);

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
extern "C" {
    fn memtrail_trampoline();
}

/// Address the ghost stack patches into saved return slots, or zero on
/// architectures without a trampoline (ghost mode then falls back to
/// direct unwinding).
pub(crate) fn trampoline_address() -> usize {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    {
        memtrail_trampoline as usize
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        0
    }
}

/// C entry point the trampoline calls with the stack pointer the patched
/// function returned with. Returns the real return address.
#[no_mangle]
pub extern "C" fn memtrail_trampoline_landing(sp: usize) -> usize {
    crate::ghost_stack::landing(sp)
}
