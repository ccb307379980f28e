//! Result and status-flag computation for the arithmetic and logic instructions.
//!
//! Every function takes the operands and the status register, writes the flags the
//! instruction defines and returns the result. Flags an instruction leaves alone are
//! not touched.

use crate::state::StatusRegister;

const fn bit8(value: u8, n: u8) -> bool {
    value & (1 << n) != 0
}

const fn bit16(value: u16, n: u8) -> bool {
    value & (1 << n) != 0
}

const fn set_nzs(sreg: &mut StatusRegister, result: u8) {
    sreg.n = bit8(result, 7);
    sreg.z = result == 0;
    sreg.s = sreg.n ^ sreg.v;
}

/// `ADD` (`carry == false`) and `ADC`.
pub fn add(sreg: &mut StatusRegister, a: u8, b: u8, carry: bool) -> u8 {
    let c = u8::from(carry);
    let wide = u16::from(a) + u16::from(b) + u16::from(c);
    let result = wide.to_le_bytes()[0];
    let (a7, b7, r7) = (bit8(a, 7), bit8(b, 7), bit8(result, 7));

    sreg.h = (a & 0x0F) + (b & 0x0F) + c > 0x0F;
    sreg.c = wide > 0xFF;
    sreg.v = (a7 && b7 && !r7) || (!a7 && !b7 && r7);
    set_nzs(sreg, result);
    result
}

/// `SUB`/`SUBI`/`CP`/`CPI` (`carry == false`, `keep_zero == false`) and the
/// carry-chained `SBC`/`CPC` (`keep_zero == true`), whose zero flag can only stay set.
pub fn sub(sreg: &mut StatusRegister, a: u8, b: u8, carry: bool, keep_zero: bool) -> u8 {
    let result = a.wrapping_sub(b).wrapping_sub(u8::from(carry));
    let (a3, b3, r3) = (bit8(a, 3), bit8(b, 3), bit8(result, 3));
    let (a7, b7, r7) = (bit8(a, 7), bit8(b, 7), bit8(result, 7));

    sreg.h = (!a3 && b3) || (b3 && r3) || (r3 && !a3);
    sreg.c = (!a7 && b7) || (b7 && r7) || (r7 && !a7);
    sreg.v = (a7 && !b7 && !r7) || (!a7 && b7 && r7);
    let zero_before = sreg.z;
    set_nzs(sreg, result);
    if keep_zero {
        sreg.z = result == 0 && zero_before;
    }
    result
}

/// Flags of `AND`/`OR`/`EOR` and their immediate forms.
pub const fn logic(sreg: &mut StatusRegister, result: u8) -> u8 {
    sreg.v = false;
    set_nzs(sreg, result);
    result
}

/// `COM`.
pub const fn com(sreg: &mut StatusRegister, a: u8) -> u8 {
    let result = !a;
    sreg.c = true;
    sreg.v = false;
    set_nzs(sreg, result);
    result
}

/// `INC`; carry is untouched.
pub const fn inc(sreg: &mut StatusRegister, a: u8) -> u8 {
    let result = a.wrapping_add(1);
    sreg.v = a == 0x7F;
    set_nzs(sreg, result);
    result
}

/// `DEC`; carry is untouched.
pub const fn dec(sreg: &mut StatusRegister, a: u8) -> u8 {
    let result = a.wrapping_sub(1);
    sreg.v = a == 0x80;
    set_nzs(sreg, result);
    result
}

/// `LSR`.
pub const fn lsr(sreg: &mut StatusRegister, a: u8) -> u8 {
    let result = a >> 1;
    sreg.c = bit8(a, 0);
    sreg.n = false;
    sreg.z = result == 0;
    sreg.v = sreg.n ^ sreg.c;
    sreg.s = sreg.n ^ sreg.v;
    result
}

/// `ADIW`.
pub fn adiw(sreg: &mut StatusRegister, word: u16, k: u8) -> u16 {
    let result = word.wrapping_add(u16::from(k));
    let (a15, r15) = (bit16(word, 15), bit16(result, 15));
    sreg.v = !a15 && r15;
    sreg.c = !r15 && a15;
    sreg.n = r15;
    sreg.z = result == 0;
    sreg.s = sreg.n ^ sreg.v;
    result
}

/// `SBIW`.
pub fn sbiw(sreg: &mut StatusRegister, word: u16, k: u8) -> u16 {
    let result = word.wrapping_sub(u16::from(k));
    let (a15, r15) = (bit16(word, 15), bit16(result, 15));
    sreg.v = a15 && !r15;
    sreg.c = r15 && !a15;
    sreg.n = r15;
    sreg.z = result == 0;
    sreg.s = sreg.n ^ sreg.v;
    result
}
