//! Code cache, patchable sites and the patch capability
//!
//! Compiled code is modelled as a run of machine words. A patchable site is
//! a word that starts as a NOP and can be overwritten, exactly once, with a
//! branch to some destination (a deopt stub, a helper, the recompilation
//! stub). Words are atomics, so executing threads may read a body while a
//! patch lands; the only write path is [`PatchTarget::patch`].
//!
//! Layout is only final once a [`CodeBuffer`] is placed in the cache, so
//! emission hands out [`SiteLabel`]s (word offsets) and the concrete
//! [`CodeAddress`] comes from the placed [`CodeBody`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{Error, Result};
use crate::ids::{BodyId, CodeAddress, MethodId};

/// Bytes per code word
pub const WORD_SIZE: u64 = 8;

const NOP_WORD: u64 = 0x9090_9090_9090_9090;
const TRAP_WORD: u64 = 0xCC00_0000_0000_0000;
const TAG_SHIFT: u32 = 56;
const ADDR_MASK: u64 = (1 << TAG_SHIFT) - 1;
const JUMP_TAG: u64 = 0xE9;
const INSN_TAG: u64 = 0x48;

/// Where helper stubs live; bodies are placed above this
const HELPER_BASE: u64 = 0x1000;
const BODY_BASE: u64 = 0x10_0000;
const BODY_ALIGN: u64 = 64;

/// Decoded contents of one code word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Word {
    Nop,
    Jump(CodeAddress),
    Trap,
    Insn(u64),
}

impl Word {
    fn encode(self) -> u64 {
        match self {
            Word::Nop => NOP_WORD,
            Word::Trap => TRAP_WORD,
            Word::Jump(dest) => (JUMP_TAG << TAG_SHIFT) | (dest.0 & ADDR_MASK),
            Word::Insn(payload) => (INSN_TAG << TAG_SHIFT) | (payload & ADDR_MASK),
        }
    }

    fn decode(raw: u64) -> Word {
        match raw {
            NOP_WORD => Word::Nop,
            TRAP_WORD => Word::Trap,
            _ if raw >> TAG_SHIFT == JUMP_TAG => Word::Jump(CodeAddress(raw & ADDR_MASK)),
            _ => Word::Insn(raw & ADDR_MASK),
        }
    }
}

/// Word offset of an emitted site inside its body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteLabel(pub u32);

/// Result of a patch request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Patched,
    /// The location already branches somewhere; nothing was written
    AlreadyPatched,
}

/// The single capability allowed to rewrite generated code.
///
/// Preconditions: `location` is word aligned and addresses a patchable word
/// of a body that is still in the cache. A location that already holds a
/// branch is left untouched, which makes concurrent or repeated patches of
/// one site harmless.
pub trait PatchTarget {
    fn patch(&self, location: CodeAddress, destination: CodeAddress) -> Result<PatchOutcome>;
}

/// Code under construction; addresses are not known yet
#[derive(Debug, Clone)]
pub struct CodeBuffer {
    words: Vec<u64>,
    patchable: Vec<u32>,
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeBuffer {
    /// A buffer whose first word is the patchable entry site
    pub fn new() -> Self {
        Self {
            words: vec![NOP_WORD],
            patchable: vec![0],
        }
    }

    pub fn entry(&self) -> SiteLabel {
        SiteLabel(0)
    }

    fn push(&mut self, word: u64) -> SiteLabel {
        self.words.push(word);
        SiteLabel((self.words.len() - 1) as u32)
    }

    /// An ordinary, never-patched instruction
    pub fn emit_instruction(&mut self, payload: u64) -> SiteLabel {
        self.push(Word::Insn(payload).encode())
    }

    /// A NOP that a later event may turn into a branch
    pub fn emit_patchable_site(&mut self) -> SiteLabel {
        let label = self.push(NOP_WORD);
        self.patchable.push(label.0);
        label
    }

    /// Slow-path landing pad for a guard
    pub fn emit_deopt_stub(&mut self) -> SiteLabel {
        self.push(TRAP_WORD)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Nothing emitted past the entry site
    pub fn is_empty(&self) -> bool {
        self.words.len() == 1
    }
}

/// A body placed in the cache; its layout is final
#[derive(Debug)]
pub struct CodeBody {
    id: BodyId,
    method: Option<MethodId>,
    base: CodeAddress,
    words: Box<[AtomicU64]>,
    patchable: Box<[u32]>,
    installed: AtomicBool,
    invalidated: AtomicBool,
}

impl CodeBody {
    pub fn id(&self) -> BodyId {
        self.id
    }

    pub fn method(&self) -> Option<MethodId> {
        self.method
    }

    pub fn base(&self) -> CodeAddress {
        self.base
    }

    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    /// Concrete address of an emitted label
    pub fn address_of(&self, label: SiteLabel) -> CodeAddress {
        self.base.offset(label.0 as u64)
    }

    pub fn entry(&self) -> CodeAddress {
        self.base
    }

    pub fn contains(&self, address: CodeAddress) -> bool {
        address >= self.base && address.0 < self.base.0 + self.words.len() as u64 * WORD_SIZE
    }

    fn index_of(&self, address: CodeAddress) -> Option<usize> {
        if !self.contains(address) || (address.0 - self.base.0) % WORD_SIZE != 0 {
            return None;
        }
        Some(((address.0 - self.base.0) / WORD_SIZE) as usize)
    }

    pub fn read(&self, address: CodeAddress) -> Option<Word> {
        let index = self.index_of(address)?;
        Some(Word::decode(self.words[index].load(Ordering::Acquire)))
    }

    pub fn read_label(&self, label: SiteLabel) -> Option<Word> {
        self.read(self.address_of(label))
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    pub(crate) fn mark_invalidated(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    fn patch_word(&self, location: CodeAddress, destination: CodeAddress) -> Result<PatchOutcome> {
        let index = self
            .index_of(location)
            .filter(|i| self.patchable.binary_search(&(*i as u32)).is_ok())
            .ok_or(Error::InvalidAddress(location))?;
        let jump = Word::Jump(destination).encode();
        let word = &self.words[index];
        let mut current = word.load(Ordering::Acquire);
        loop {
            if matches!(Word::decode(current), Word::Jump(_)) {
                return Ok(PatchOutcome::AlreadyPatched);
            }
            match word.compare_exchange(current, jump, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(PatchOutcome::Patched),
                Err(actual) => current = actual,
            }
        }
    }
}

/// All placed bodies, addressable by id and by address
#[derive(Debug)]
pub struct CodeCache {
    bodies: FxHashMap<BodyId, Arc<CodeBody>>,
    by_base: BTreeMap<CodeAddress, BodyId>,
    helpers: Arc<CodeBody>,
    next_base: u64,
    next_id: u64,
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeCache {
    pub fn new() -> Self {
        let helpers = Arc::new(CodeBody {
            id: BodyId(0),
            method: None,
            base: CodeAddress(HELPER_BASE),
            words: vec![AtomicU64::new(TRAP_WORD)].into_boxed_slice(),
            patchable: Box::new([]),
            installed: AtomicBool::new(true),
            invalidated: AtomicBool::new(false),
        });
        Self {
            bodies: FxHashMap::default(),
            by_base: BTreeMap::new(),
            helpers,
            next_base: BODY_BASE,
            next_id: 1,
        }
    }

    /// Entry of the stub that requests recompilation of the caller
    pub fn recompile_helper(&self) -> CodeAddress {
        self.helpers.entry()
    }

    /// Place a finished buffer; the body is not reachable until [`install`](Self::install)
    pub fn allocate(&mut self, buffer: CodeBuffer, method: Option<MethodId>) -> Arc<CodeBody> {
        let id = BodyId(self.next_id);
        self.next_id += 1;
        let base = CodeAddress(self.next_base);
        let bytes = buffer.words.len() as u64 * WORD_SIZE;
        self.next_base += bytes.div_ceil(BODY_ALIGN) * BODY_ALIGN + BODY_ALIGN;

        let mut patchable = buffer.patchable;
        patchable.sort_unstable();
        let body = Arc::new(CodeBody {
            id,
            method,
            base,
            words: buffer.words.into_iter().map(AtomicU64::new).collect(),
            patchable: patchable.into_boxed_slice(),
            installed: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
        });
        self.bodies.insert(id, Arc::clone(&body));
        self.by_base.insert(base, id);
        trace!(body = %id, base = %base, words = body.len_words(), "body placed");
        body
    }

    pub fn install(&self, id: BodyId) -> Result<()> {
        let body = self.bodies.get(&id).ok_or_else(|| Error::unknown_body(id))?;
        body.installed.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove a body from the cache; its addresses stop being patchable
    pub fn discard(&mut self, id: BodyId) -> Option<Arc<CodeBody>> {
        let body = self.bodies.remove(&id)?;
        self.by_base.remove(&body.base);
        body.installed.store(false, Ordering::Release);
        Some(body)
    }

    pub fn body(&self, id: BodyId) -> Option<&Arc<CodeBody>> {
        self.bodies.get(&id)
    }

    pub fn body_at(&self, address: CodeAddress) -> Option<&Arc<CodeBody>> {
        let (_, id) = self.by_base.range(..=address).next_back()?;
        self.bodies.get(id).filter(|b| b.contains(address))
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

impl PatchTarget for CodeCache {
    fn patch(&self, location: CodeAddress, destination: CodeAddress) -> Result<PatchOutcome> {
        let body = self.body_at(location).ok_or(Error::InvalidAddress(location))?;
        let outcome = body.patch_word(location, destination)?;
        trace!(location = %location, destination = %destination, ?outcome, "patch");
        Ok(outcome)
    }
}
