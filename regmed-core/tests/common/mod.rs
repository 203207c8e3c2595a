//! A small interpreter over the instruction model, used to execute
//! instrumented blocks and check that application semantics survive
//! instrumentation. Memory is a sparse byte map, except that
//! addresses inside the published SIMD block window resolve to the
//! slot store, the way generated code reaches it through the hidden
//! pointer.

#![allow(dead_code)]

use std::collections::BTreeMap;

use regmed_core::SlotStore;
use regmed_isa::{AFlags, Cc, Instr, InstrList, MachineContext, MemRef, Opcode, Opnd, Width};

pub struct Machine {
    pub ctx: MachineContext,
    mem: BTreeMap<u64, u8>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            ctx: MachineContext::default(),
            mem: BTreeMap::new(),
        }
    }

    /// Execute the whole list.
    pub fn run(&mut self, list: &InstrList, slots: &mut SlotStore) {
        self.run_until(list, slots, list.len());
    }

    /// Execute instructions `0..stop`.
    pub fn run_until(&mut self, list: &InstrList, slots: &mut SlotStore, stop: usize) {
        self.run_range(list, slots, 0, stop);
    }

    /// Execute instructions `start..stop`.
    pub fn run_range(&mut self, list: &InstrList, slots: &mut SlotStore, start: usize, stop: usize) {
        for idx in start..stop {
            self.exec(list.at(idx), slots);
        }
    }

    pub fn poke_mem(&mut self, addr: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.mem.insert(addr + i as u64, *b);
        }
    }

    fn width_bits(width: Width) -> u32 {
        match width {
            Width::B1 => 8,
            Width::B2 => 16,
            Width::B4 => 32,
            _ => 64,
        }
    }

    fn mem_addr(&self, mem: &MemRef) -> u64 {
        let base = mem.base.map(|r| self.ctx.get_gpr(r)).unwrap_or(0);
        let index = mem
            .index
            .map(|r| self.ctx.get_gpr(r) * mem.scale as u64)
            .unwrap_or(0);
        base.wrapping_add(index).wrapping_add(mem.disp as i64 as u64)
    }

    fn read_opnd(&self, opnd: &Opnd, slots: &SlotStore) -> u64 {
        match opnd {
            Opnd::Imm(v) => *v as u64,
            Opnd::Tls(off) => slots.tls_read(*off),
            Opnd::Reg(r) => {
                let bits = Self::width_bits(r.width);
                let value = self.ctx.get_gpr(r.reg);
                if bits == 64 {
                    value
                } else {
                    value & ((1u64 << bits) - 1)
                }
            }
            Opnd::Mem(m) => {
                let addr = self.mem_addr(m);
                let mut value = 0u64;
                for i in (0..8u64).rev() {
                    value = (value << 8) | u64::from(self.read_byte(addr + i, slots));
                }
                value
            }
        }
    }

    fn write_opnd(&mut self, opnd: &Opnd, value: u64, slots: &mut SlotStore) {
        match opnd {
            Opnd::Imm(_) => {}
            Opnd::Tls(off) => slots.tls_write(*off, value),
            Opnd::Reg(r) => {
                let old = self.ctx.get_gpr(r.reg);
                let new = match r.width {
                    Width::B1 => (old & !0xff) | (value & 0xff),
                    Width::B2 => (old & !0xffff) | (value & 0xffff),
                    // Four-byte writes zero-extend.
                    Width::B4 => value & 0xffff_ffff,
                    _ => value,
                };
                self.ctx.set_gpr(r.reg, new);
            }
            Opnd::Mem(m) => {
                let addr = self.mem_addr(m);
                for i in 0..8u64 {
                    self.write_byte(addr + i, (value >> (8 * i)) as u8, slots);
                }
            }
        }
    }

    fn in_simd_block(&self, addr: u64, slots: &SlotStore) -> Option<(usize, usize)> {
        let base = slots.simd_block_base();
        let size = (slots.num_simd() * 64) as u64;
        if addr >= base && addr < base + size {
            let off = (addr - base) as usize;
            Some((off / 64, off % 64))
        } else {
            None
        }
    }

    fn read_byte(&self, addr: u64, slots: &SlotStore) -> u8 {
        if let Some((slot, off)) = self.in_simd_block(addr, slots) {
            return slots.simd_read(slot)[off];
        }
        self.mem.get(&addr).copied().unwrap_or(0)
    }

    fn write_byte(&mut self, addr: u64, byte: u8, slots: &mut SlotStore) {
        if let Some((slot, off)) = self.in_simd_block(addr, slots) {
            let mut bytes = *slots.simd_read(slot);
            bytes[off] = byte;
            slots.simd_write(slot, &bytes);
            return;
        }
        self.mem.insert(addr, byte);
    }

    fn read_simd16(&self, opnd: &Opnd, slots: &SlotStore) -> [u8; 16] {
        let mut out = [0u8; 16];
        match opnd {
            Opnd::Reg(r) => out.copy_from_slice(&self.ctx.get_simd(r.reg)[..16]),
            Opnd::Mem(m) => {
                let addr = self.mem_addr(m);
                for (i, b) in out.iter_mut().enumerate() {
                    *b = self.read_byte(addr + i as u64, slots);
                }
            }
            _ => {}
        }
        out
    }

    fn write_simd16(&mut self, opnd: &Opnd, bytes: [u8; 16], slots: &mut SlotStore) {
        match opnd {
            Opnd::Reg(r) => self.ctx.set_simd_lane(r.reg, &bytes),
            Opnd::Mem(m) => {
                let addr = self.mem_addr(m);
                for (i, b) in bytes.iter().enumerate() {
                    self.write_byte(addr + i as u64, *b, slots);
                }
            }
            _ => {}
        }
    }

    fn arith_flags(&mut self, width: Width, a: u64, b: u64, result: u64, carry: bool, sub: bool) {
        let bits = Self::width_bits(width);
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let r = result & mask;
        let sign = 1u64 << (bits - 1);
        let mut flags = AFlags::NONE;
        if carry {
            flags |= AFlags::CF;
        }
        if r == 0 {
            flags |= AFlags::ZF;
        }
        if r & sign != 0 {
            flags |= AFlags::SF;
        }
        if (r & 0xff).count_ones() % 2 == 0 {
            flags |= AFlags::PF;
        }
        let b_eff = if sub { !b } else { b };
        if ((a ^ r) & (b_eff & mask ^ r)) & sign != 0 {
            flags |= AFlags::OF;
        }
        if ((a ^ b ^ r) & 0x10) != 0 {
            flags |= AFlags::AF;
        }
        self.ctx.set_aflags(flags);
    }

    fn cc_holds(&self, cc: Cc) -> bool {
        let f = self.ctx.aflags_set();
        match cc {
            Cc::E => f.contains(AFlags::ZF),
            Cc::Ne => !f.contains(AFlags::ZF),
            Cc::S => f.contains(AFlags::SF),
            Cc::Ns => !f.contains(AFlags::SF),
            Cc::O => f.contains(AFlags::OF),
            Cc::No => !f.contains(AFlags::OF),
            Cc::B => f.contains(AFlags::CF),
            Cc::Ae => !f.contains(AFlags::CF),
            _ => false,
        }
    }

    fn exec(&mut self, instr: &Instr, slots: &mut SlotStore) {
        match instr.opcode() {
            Opcode::Mov => {
                let value = self.read_opnd(&instr.srcs()[0], slots);
                self.write_opnd(&instr.dsts()[0].clone(), value, slots);
            }
            Opcode::MovSimd => {
                let bytes = self.read_simd16(&instr.srcs()[0], slots);
                self.write_simd16(&instr.dsts()[0].clone(), bytes, slots);
            }
            Opcode::Cmov(cc) => {
                if self.cc_holds(cc) {
                    let value = self.read_opnd(&instr.srcs()[0], slots);
                    self.write_opnd(&instr.dsts()[0].clone(), value, slots);
                }
            }
            Opcode::Add | Opcode::Adc | Opcode::Sub => {
                let dst = instr.dsts()[0].clone();
                let width = dst.as_reg().map(|r| r.width).unwrap_or(Width::B8);
                let bits = Self::width_bits(width);
                let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
                let a = self.read_opnd(&dst, slots) & mask;
                let b = self.read_opnd(&instr.srcs()[0], slots) & mask;
                let carry_in = u64::from(
                    instr.opcode() == Opcode::Adc
                        && self.ctx.aflags_set().contains(AFlags::CF),
                );
                let (wide, sub) = match instr.opcode() {
                    Opcode::Sub => (a.wrapping_sub(b), true),
                    _ => (a.wrapping_add(b).wrapping_add(carry_in), false),
                };
                let result = wide & mask;
                let carry = if sub {
                    b > a
                } else {
                    (a as u128 + b as u128 + carry_in as u128) > mask as u128
                };
                self.arith_flags(width, a, b, result, carry, sub);
                self.write_opnd(&dst, result, slots);
            }
            Opcode::Cmp => {
                let a = self.read_opnd(&instr.srcs()[0], slots);
                let b = self.read_opnd(&instr.srcs()[1], slots);
                let result = a.wrapping_sub(b);
                self.arith_flags(Width::B8, a, b, result, b > a, true);
            }
            Opcode::Test => {
                let a = self.read_opnd(&instr.srcs()[0], slots);
                let b = self.read_opnd(&instr.srcs()[1], slots);
                let result = a & b;
                self.arith_flags(Width::B8, a, b, result, false, false);
                // Logical ops clear carry and overflow.
                let flags = self.ctx.aflags_set() - (AFlags::CF | AFlags::OF);
                self.ctx.set_aflags(flags);
            }
            Opcode::Xor => {
                let dst = instr.dsts()[0].clone();
                let a = self.read_opnd(&dst, slots);
                let b = self.read_opnd(&instr.srcs()[0], slots);
                let result = a ^ b;
                self.arith_flags(Width::B8, a, b, result, false, false);
                let flags = self.ctx.aflags_set() - (AFlags::CF | AFlags::OF);
                self.ctx.set_aflags(flags);
                self.write_opnd(&dst, result, slots);
            }
            Opcode::Inc | Opcode::Dec => {
                let dst = instr.dsts()[0].clone();
                let a = self.read_opnd(&dst, slots);
                let sub = instr.opcode() == Opcode::Dec;
                let result = if sub {
                    a.wrapping_sub(1)
                } else {
                    a.wrapping_add(1)
                };
                let saved_cf = self.ctx.aflags_set().contains(AFlags::CF);
                self.arith_flags(Width::B8, a, 1, result, false, sub);
                let mut flags = self.ctx.aflags_set() - AFlags::CF;
                if saved_cf {
                    flags |= AFlags::CF;
                }
                self.ctx.set_aflags(flags);
                self.write_opnd(&dst, result, slots);
            }
            Opcode::Lahf => {
                let byte = self.ctx.flags_to_byte();
                let rax = self.ctx.get_gpr(regmed_isa::Reg::Rax);
                self.ctx
                    .set_gpr(regmed_isa::Reg::Rax, (rax & !0xff00) | (u64::from(byte) << 8));
            }
            Opcode::Seto => {
                let of = self.ctx.overflow_byte();
                let rax = self.ctx.get_gpr(regmed_isa::Reg::Rax);
                self.ctx
                    .set_gpr(regmed_isa::Reg::Rax, (rax & !0xff) | u64::from(of));
            }
            Opcode::Sahf => {
                let ah = ((self.ctx.get_gpr(regmed_isa::Reg::Rax) >> 8) & 0xff) as u8;
                self.ctx.set_flags_from_byte(ah);
            }
            // Straight-line execution: transfers and system entries
            // are block terminators in these tests.
            Opcode::Jmp
            | Opcode::Jcc(_)
            | Opcode::Call
            | Opcode::Ret
            | Opcode::Syscall
            | Opcode::Int
            | Opcode::Nop => {}
        }
    }
}
