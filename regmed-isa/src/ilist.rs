//! Instruction-list container
//!
//! Basic blocks travel through instrumentation as instruction lists.
//! Entries carry stable ids so that insertion points survive earlier
//! insertions, the way instrumentation passes hold onto an
//! instruction while rewriting around it. The list also owns the
//! auto-predication state: when set, meta instructions inserted into
//! the list are predicated automatically.

use crate::instr::{Cc, Instr};

/// Stable identity of one instruction within a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrId(u32);

/// A basic block's instructions.
#[derive(Debug, Clone, Default)]
pub struct InstrList {
    entries: Vec<(InstrId, Instr)>,
    next_id: u32,
    auto_pred: Option<Cc>,
}

impl InstrList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a block from application instructions.
    pub fn from_app_instrs(instrs: Vec<Instr>) -> Self {
        let mut list = Self::new();
        for instr in instrs {
            list.append(instr);
        }
        list
    }

    fn fresh_id(&mut self) -> InstrId {
        let id = InstrId(self.next_id);
        self.next_id += 1;
        id
    }

    fn predicate(&self, mut instr: Instr) -> Instr {
        if let Some(cc) = self.auto_pred {
            if !instr.is_app() && instr.pred().is_none() && instr.is_predicatable() {
                instr.set_pred(Some(cc));
            }
        }
        instr
    }

    pub fn append(&mut self, instr: Instr) -> InstrId {
        let instr = self.predicate(instr);
        let id = self.fresh_id();
        self.entries.push((id, instr));
        id
    }

    /// Insert `instr` immediately before the instruction `at`.
    pub fn insert_before(&mut self, at: InstrId, instr: Instr) -> Option<InstrId> {
        let idx = self.index_of(at)?;
        let instr = self.predicate(instr);
        let id = self.fresh_id();
        self.entries.insert(idx, (id, instr));
        Some(id)
    }

    /// Insert `instr` immediately after the instruction `at`.
    pub fn insert_after(&mut self, at: InstrId, instr: Instr) -> Option<InstrId> {
        let idx = self.index_of(at)?;
        let instr = self.predicate(instr);
        let id = self.fresh_id();
        self.entries.insert(idx + 1, (id, instr));
        Some(id)
    }

    pub fn index_of(&self, id: InstrId) -> Option<usize> {
        self.entries.iter().position(|(eid, _)| *eid == id)
    }

    pub fn get(&self, id: InstrId) -> Option<&Instr> {
        self.entries
            .iter()
            .find(|(eid, _)| *eid == id)
            .map(|(_, i)| i)
    }

    pub fn get_mut(&mut self, id: InstrId) -> Option<&mut Instr> {
        self.entries
            .iter_mut()
            .find(|(eid, _)| *eid == id)
            .map(|(_, i)| i)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn at(&self, idx: usize) -> &Instr {
        &self.entries[idx].1
    }

    pub fn id_at(&self, idx: usize) -> InstrId {
        self.entries[idx].0
    }

    pub fn instrs(&self) -> impl Iterator<Item = &Instr> {
        self.entries.iter().map(|(_, i)| i)
    }

    pub fn ids(&self) -> impl Iterator<Item = InstrId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    /// Ids of the original application instructions, in order.
    pub fn app_ids(&self) -> Vec<InstrId> {
        self.entries
            .iter()
            .filter(|(_, i)| i.is_app())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Set the auto-predication state, returning the previous one.
    /// Passes that must emit unconditional code save this, clear it,
    /// and restore it afterwards.
    pub fn set_auto_pred(&mut self, pred: Option<Cc>) -> Option<Cc> {
        std::mem::replace(&mut self.auto_pred, pred)
    }

    pub fn auto_pred(&self) -> Option<Cc> {
        self.auto_pred
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::Opcode;
    use crate::opnd::Opnd;
    use crate::reg::Reg;

    fn app_nop() -> Instr {
        Instr::app(Opcode::Nop, vec![], vec![])
    }

    #[test]
    fn test_insert_before_and_after_keep_ids_stable() {
        let mut list = InstrList::from_app_instrs(vec![app_nop(), app_nop()]);
        let ids = list.app_ids();
        list.insert_before(ids[1], Instr::nop());
        list.insert_after(ids[0], Instr::nop());
        assert_eq!(list.len(), 4);
        assert_eq!(list.index_of(ids[0]), Some(0));
        assert_eq!(list.index_of(ids[1]), Some(3));
    }

    #[test]
    fn test_auto_pred_applies_to_meta_only() {
        let mut list = InstrList::new();
        list.set_auto_pred(Some(Cc::E));
        let app = list.append(Instr::app(
            Opcode::Mov,
            vec![Opnd::reg(Reg::Rax)],
            vec![Opnd::imm(0)],
        ));
        let meta = list.append(Instr::mov(Opnd::reg(Reg::Rbx), Opnd::imm(0)));
        assert_eq!(list.get(app).unwrap().pred(), None);
        assert_eq!(list.get(meta).unwrap().pred(), Some(Cc::E));
    }

    #[test]
    fn test_auto_pred_save_and_restore() {
        let mut list = InstrList::new();
        list.set_auto_pred(Some(Cc::Ne));
        let prior = list.set_auto_pred(None);
        assert_eq!(prior, Some(Cc::Ne));
        let id = list.append(Instr::mov(Opnd::reg(Reg::Rbx), Opnd::imm(0)));
        assert_eq!(list.get(id).unwrap().pred(), None);
        list.set_auto_pred(prior);
        assert_eq!(list.auto_pred(), Some(Cc::Ne));
    }
}
