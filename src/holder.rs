//! The code holder: the container every emitter writes into.
//!
//! A [`CodeHolder`] owns the sections, the label table, the pending-link
//! pool, and the relocation table of one logical code image, and maintains
//! the invariants that make incremental emission correct:
//!
//! - a label is *bound* exactly when it has a section and no pending links;
//! - the unresolved-label count equals the number of labels with pending
//!   links, and must reach zero before relocation can succeed;
//! - section ids are assigned in insertion order and never reused.
//!
//! The holder is strictly single-threaded during emission; distinct holders
//! are independent. [`CodeHolder::relocate`] takes `&self` and may run
//! concurrently with other `relocate` calls on the same holder.

use crate::buffer::CodeOffset;
use crate::emitter::EmitterKind;
use crate::label::{
    name_hash, Label, LabelEntry, LabelLink, LabelType, LinkIndex, MAX_LABEL_COUNT,
    MAX_LABEL_NAME_LEN,
};
use crate::reloc::{fits_signed, RelocEntry, RelocKind, INVALID_RELOC_ID};
use crate::relocate;
use crate::section::{Section, SectionFlags, INVALID_SECTION_ID, MAX_SECTION_NAME_LEN};
use crate::target::CodeInfo;
use crate::trampoline;
use crate::result::{AsmResult, Error};
use hashbrown::HashTable;
use smallvec::SmallVec;

/// Receiver for errors surfaced by attached emitters.
///
/// The handler is a notification channel, not a control-flow mechanism: the
/// failing operation still returns its error code. The holder itself never
/// invokes the handler; only emitters do, on their first error.
pub trait ErrorHandler {
    /// Called with the error and a short, human-readable origin message.
    fn handle_error(&mut self, error: Error, message: &str);
}

/// An architecture-aware container for sections, labels, and relocations.
pub struct CodeHolder {
    info: Option<CodeInfo>,
    sections: Vec<Section>,
    labels: Vec<LabelEntry>,
    named_labels: HashTable<Label>,
    links: Vec<LabelLink>,
    free_links: Vec<LinkIndex>,
    relocs: Vec<RelocEntry>,
    unresolved_label_count: u32,
    attached: SmallVec<[EmitterKind; 2]>,
    error_handler: Option<Box<dyn ErrorHandler>>,
}

impl Default for CodeHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeHolder {
    /// Create an uninitialized holder; call [`CodeHolder::init`] before use.
    pub fn new() -> Self {
        Self {
            info: None,
            sections: Vec::new(),
            labels: Vec::new(),
            named_labels: HashTable::new(),
            links: Vec::new(),
            free_links: Vec::new(),
            relocs: Vec::new(),
            unresolved_label_count: 0,
            attached: SmallVec::new(),
            error_handler: None,
        }
    }

    /// Create a holder already initialized for `info`.
    pub fn with_info(info: CodeInfo) -> Self {
        let mut holder = Self::new();
        holder
            .init(info)
            .expect("a fresh holder accepts initialization");
        holder
    }

    /// Initialize the holder for a target, creating the default `.text`
    /// section (id 0, executable, alignment 1).
    ///
    /// Valid only in the uninitialized state; fails with
    /// `AlreadyInitialized` otherwise.
    pub fn init(&mut self, info: CodeInfo) -> AsmResult<()> {
        if self.info.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        self.info = Some(info);
        self.sections
            .push(Section::new(0, ".text", SectionFlags::EXEC, 1));
        log::debug!("holder: initialized for {:?}", info.arch());
        Ok(())
    }

    /// Whether [`CodeHolder::init`] has been called.
    pub fn is_initialized(&self) -> bool {
        self.info.is_some()
    }

    /// Return the holder to the uninitialized state, discarding all
    /// sections, labels, links, and relocations.
    ///
    /// With `release_memory` the backing allocations are returned to the
    /// heap as well; otherwise capacity is retained for reuse. Emitters
    /// cannot be attached across a reset: attachment borrows the holder
    /// mutably, so the borrow checker forces detachment first. The
    /// installed error handler survives.
    pub fn reset(&mut self, release_memory: bool) {
        debug_assert!(self.attached.is_empty());
        self.info = None;
        self.unresolved_label_count = 0;
        self.attached.clear();
        if release_memory {
            self.sections = Vec::new();
            self.labels = Vec::new();
            self.named_labels = HashTable::new();
            self.links = Vec::new();
            self.free_links = Vec::new();
            self.relocs = Vec::new();
        } else {
            self.sections.clear();
            self.labels.clear();
            self.named_labels.clear();
            self.links.clear();
            self.free_links.clear();
            self.relocs.clear();
        }
    }

    /// The target description, once initialized.
    pub fn info(&self) -> AsmResult<&CodeInfo> {
        self.info.as_ref().ok_or(Error::NotInitialized)
    }

    // === Emitter slots ===

    /// Occupy the slot for an emitter kind.
    ///
    /// At most one emitter of each kind may be attached; a second fails
    /// with `SlotOccupied`.
    pub fn attach(&mut self, kind: EmitterKind) -> AsmResult<()> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        if self.attached.contains(&kind) {
            return Err(Error::SlotOccupied);
        }
        self.attached.push(kind);
        Ok(())
    }

    /// Vacate the slot for an emitter kind.
    pub fn detach(&mut self, kind: EmitterKind) -> AsmResult<()> {
        match self.attached.iter().rposition(|&k| k == kind) {
            Some(at) => {
                self.attached.remove(at);
                Ok(())
            }
            None => Err(Error::InvalidState),
        }
    }

    /// The emitter kinds currently attached.
    pub fn attached_kinds(&self) -> &[EmitterKind] {
        &self.attached
    }

    // === Error handler ===

    /// Install an error handler for attached emitters to notify.
    pub fn set_error_handler(&mut self, handler: Box<dyn ErrorHandler>) {
        self.error_handler = Some(handler);
    }

    /// Remove the installed error handler, returning it.
    pub fn take_error_handler(&mut self) -> Option<Box<dyn ErrorHandler>> {
        self.error_handler.take()
    }

    /// Whether an error handler is installed.
    pub fn has_error_handler(&self) -> bool {
        self.error_handler.is_some()
    }

    /// Notify the installed handler (if any) and pass `error` through.
    /// Called by emitters, never by the holder.
    pub(crate) fn report_error(&mut self, error: Error, message: &str) -> Error {
        log::debug!("emitter error: {error} ({message})");
        if let Some(handler) = self.error_handler.as_mut() {
            handler.handle_error(error, message);
        }
        error
    }

    // === Sections ===

    /// Create a section with the next free id.
    ///
    /// `name` is capped at 35 bytes, `alignment` must be a power of two no
    /// larger than 64 (0 means 1).
    pub fn add_section(
        &mut self,
        name: &str,
        flags: SectionFlags,
        alignment: u32,
    ) -> AsmResult<u32> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        if name.len() > MAX_SECTION_NAME_LEN {
            return Err(Error::InvalidArgument);
        }
        let alignment = if alignment == 0 { 1 } else { alignment };
        if !alignment.is_power_of_two() || alignment > 64 {
            return Err(Error::InvalidArgument);
        }
        if self.sections.len() >= INVALID_SECTION_ID as usize {
            return Err(Error::InvalidState);
        }
        let id = self.sections.len() as u32;
        self.sections.push(Section::new(id, name, flags, alignment));
        log::debug!("holder: added section {id} {name:?} ({flags:?}, align {alignment})");
        Ok(id)
    }

    /// Number of sections.
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Look up a section by id.
    pub fn section(&self, id: u32) -> AsmResult<&Section> {
        self.sections
            .get(id as usize)
            .ok_or(Error::InvalidArgument)
    }

    /// Look up a section by id, mutably.
    pub fn section_mut(&mut self, id: u32) -> AsmResult<&mut Section> {
        self.sections
            .get_mut(id as usize)
            .ok_or(Error::InvalidArgument)
    }

    /// The default `.text` section.
    pub fn text_section(&self) -> AsmResult<&Section> {
        self.section(0)
    }

    /// All sections in id order.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Ensure the section's buffer has room for `n` more bytes.
    pub fn reserve_buffer(&mut self, section_id: u32, n: usize) -> AsmResult<()> {
        self.section_mut(section_id)?.buffer_mut().reserve(n)
    }

    // === Labels ===

    /// Create an anonymous label.
    pub fn new_label(&mut self) -> AsmResult<Label> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let index = self.next_label_index()?;
        self.labels.push(LabelEntry::anonymous());
        Ok(Label::from_parts(LabelType::Anonymous, index))
    }

    /// Create a named label.
    ///
    /// Only local labels may carry a parent; the parent must refer to an
    /// existing label. Names are limited to 2048 bytes. Creating a second
    /// label with the same `(parent, name)` fails with
    /// `LabelAlreadyDefined`.
    pub fn new_named_label(
        &mut self,
        name: &str,
        ty: LabelType,
        parent: Option<Label>,
    ) -> AsmResult<Label> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        if name.is_empty() {
            return Err(Error::InvalidLabelName);
        }
        if name.len() > MAX_LABEL_NAME_LEN {
            return Err(Error::LabelNameTooLong);
        }
        match ty {
            LabelType::Anonymous => {
                if parent.is_some() {
                    return Err(Error::InvalidLabelName);
                }
            }
            LabelType::Local => {
                if let Some(parent) = parent {
                    if !self.is_label_valid(parent) {
                        return Err(Error::InvalidParentLabel);
                    }
                }
            }
            LabelType::Global | LabelType::External => {
                if parent.is_some() {
                    return Err(Error::NonLocalLabelCantHaveParent);
                }
            }
        }

        // Anonymous labels keep their name for diagnostics only and skip
        // the named-label table.
        if ty == LabelType::Anonymous {
            let index = self.next_label_index()?;
            self.labels
                .push(LabelEntry::named(ty, name, None, 0));
            return Ok(Label::from_parts(ty, index));
        }

        let hash = name_hash(name, parent);
        if self.find_named(hash, name, parent).is_some() {
            return Err(Error::LabelAlreadyDefined);
        }
        let index = self.next_label_index()?;
        let label = Label::from_parts(ty, index);
        self.labels.push(LabelEntry::named(ty, name, parent, hash));
        let labels = &self.labels;
        self.named_labels
            .insert_unique(hash, label, |&l| labels[l.index() as usize].hash);
        Ok(label)
    }

    /// Find a named label by `(parent, name)` in O(1).
    pub fn label_by_name(&self, name: &str, parent: Option<Label>) -> Option<Label> {
        self.find_named(name_hash(name, parent), name, parent)
    }

    /// Whether `label` refers to a live label of this holder.
    pub fn is_label_valid(&self, label: Label) -> bool {
        label.is_valid()
            && (label.index() as usize) < self.labels.len()
            && self.labels[label.index() as usize].ty == label.label_type()
    }

    /// Whether `label` has been bound to a section and offset.
    pub fn is_label_bound(&self, label: Label) -> bool {
        self.is_label_valid(label) && self.labels[label.index() as usize].is_bound()
    }

    /// The section a bound label lives in.
    pub fn label_section_id(&self, label: Label) -> AsmResult<u32> {
        let entry = self.label_entry(label)?;
        if !entry.is_bound() {
            return Err(Error::InvalidState);
        }
        Ok(entry.section_id)
    }

    /// The offset a bound label resolves to within its section.
    pub fn label_offset(&self, label: Label) -> AsmResult<CodeOffset> {
        let entry = self.label_entry(label)?;
        if !entry.is_bound() {
            return Err(Error::InvalidState);
        }
        Ok(entry.offset)
    }

    /// Number of labels created so far.
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Number of labels that still have pending links. Must be zero before
    /// [`CodeHolder::relocate`] can succeed.
    pub fn unresolved_label_count(&self) -> u32 {
        self.unresolved_label_count
    }

    /// Queue a patch site on an unbound label.
    ///
    /// `section_id`/`offset` locate the first patch byte, `size` is the
    /// patch width in bytes (1, 2, 4, or 8), and `rel` is the extra addend
    /// applied when the displacement base is not the end of the patch
    /// field. `reloc_id` ties the link to a relocation entry that will be
    /// completed with the label's target at bind time.
    pub fn new_label_link(
        &mut self,
        label: Label,
        section_id: u32,
        offset: CodeOffset,
        rel: i32,
        size: u8,
        reloc_id: Option<u32>,
    ) -> AsmResult<()> {
        if !self.is_label_valid(label) {
            return Err(Error::InvalidLabel);
        }
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(Error::InvalidArgument);
        }
        let end = offset.checked_add(u32::from(size)).ok_or(Error::InvalidArgument)?;
        if self.section(section_id)?.physical_size() < end {
            return Err(Error::InvalidArgument);
        }
        let entry = &mut self.labels[label.index() as usize];
        if entry.is_bound() {
            return Err(Error::LabelAlreadyBound);
        }
        let link = LabelLink {
            prev: entry.links,
            section_id,
            reloc_id,
            offset,
            rel,
            size,
        };
        let index = match self.free_links.pop() {
            Some(index) => {
                self.links[index as usize] = link;
                index
            }
            None => {
                let index = self.links.len() as LinkIndex;
                self.links.push(link);
                index
            }
        };
        if entry.links.is_none() {
            self.unresolved_label_count += 1;
        }
        entry.links = Some(index);
        log::trace!("holder: queued link for {label} at [{section_id}]+{offset:#x}");
        Ok(())
    }

    /// Bind `label` to `(section_id, offset)` and resolve every queued
    /// patch in its chain.
    ///
    /// Relative patches receive `target − (site + size + rel)` and must fit
    /// their width (`InvalidDisplacement` otherwise); address-sized patches
    /// receive the target offset and complete their relocation entry. The
    /// chain is fully drained even when a patch fails; the first error is
    /// returned.
    pub fn bind_label(
        &mut self,
        label: Label,
        section_id: u32,
        offset: CodeOffset,
    ) -> AsmResult<()> {
        if !self.is_label_valid(label) {
            return Err(Error::InvalidLabel);
        }
        if section_id as usize >= self.sections.len() {
            return Err(Error::InvalidArgument);
        }
        let entry = &mut self.labels[label.index() as usize];
        if entry.is_bound() {
            return Err(Error::LabelAlreadyBound);
        }
        entry.section_id = section_id;
        entry.offset = offset;
        let had_links = entry.has_links();
        let mut next = entry.links.take();
        log::trace!("holder: bound {label} to [{section_id}]+{offset:#x}");

        let mut first_error = None;
        while let Some(index) = next {
            let link = self.links[index as usize];
            next = link.prev;
            self.free_links.push(index);
            if let Err(e) = self.resolve_link(&link, section_id, offset) {
                first_error.get_or_insert(e);
            }
        }
        if had_links {
            self.unresolved_label_count -= 1;
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn resolve_link(
        &mut self,
        link: &LabelLink,
        target_section: u32,
        target_offset: CodeOffset,
    ) -> AsmResult<()> {
        let buffer_len = self.section(link.section_id)?.physical_size();
        debug_assert!(
            link.offset + u32::from(link.size) <= buffer_len,
            "patch site outside its section"
        );
        if link.offset + u32::from(link.size) > buffer_len {
            return Err(Error::InvalidState);
        }

        if let Some(reloc_id) = link.reloc_id {
            // Address-sized reference: complete the relocation entry and
            // record the target offset in the slot.
            let entry = self
                .relocs
                .get_mut(reloc_id as usize)
                .ok_or(Error::InvalidRelocEntry)?;
            entry.set_target_offset(target_section, u64::from(target_offset));
            let size = link.size;
            self.sections[link.section_id as usize]
                .buffer_mut()
                .patch_uint(link.offset, u64::from(target_offset), size)?;
            return Ok(());
        }

        // Plain displacement: only meaningful within one section.
        if link.section_id != target_section {
            return Err(Error::InvalidRelocEntry);
        }
        let disp = i64::from(target_offset)
            - (i64::from(link.offset) + i64::from(link.size) + i64::from(link.rel));
        if !fits_signed(disp, link.size) {
            return Err(Error::InvalidDisplacement);
        }
        self.sections[link.section_id as usize]
            .buffer_mut()
            .patch_uint(link.offset, disp as u64, link.size)
    }

    // === Relocations ===

    /// Create a relocation entry of `kind` rewriting a `size`-byte slot,
    /// returning its id. Source and target are filled in afterwards via
    /// [`CodeHolder::reloc_mut`].
    pub fn new_reloc(&mut self, kind: RelocKind, size: u8) -> AsmResult<u32> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(Error::InvalidArgument);
        }
        if self.relocs.len() >= INVALID_RELOC_ID as usize {
            return Err(Error::RelocIndexOverflow);
        }
        let id = self.relocs.len() as u32;
        self.relocs.push(RelocEntry::new(id, kind, size));
        Ok(id)
    }

    /// Look up a relocation entry by id.
    pub fn reloc(&self, id: u32) -> AsmResult<&RelocEntry> {
        self.relocs.get(id as usize).ok_or(Error::InvalidRelocEntry)
    }

    /// Look up a relocation entry by id, mutably.
    pub fn reloc_mut(&mut self, id: u32) -> AsmResult<&mut RelocEntry> {
        self.relocs
            .get_mut(id as usize)
            .ok_or(Error::InvalidRelocEntry)
    }

    /// All relocation entries in id order.
    pub fn relocs(&self) -> &[RelocEntry] {
        &self.relocs
    }

    // === Layout ===

    /// Size in bytes of the laid-out image: every section rounded up to its
    /// alignment, each counted at the larger of its physical and virtual
    /// size, plus reserved space for trampolines.
    pub fn code_size(&self) -> AsmResult<usize> {
        let info = self.info()?;
        let mut size = 0usize;
        for section in &self.sections {
            size = align_up(size, section.alignment() as usize);
            size += section.effective_size() as usize;
        }
        let trampolines = self
            .relocs
            .iter()
            .filter(|r| r.kind() == RelocKind::Trampoline)
            .count();
        if trampolines != 0 {
            if let Some(slot) = trampoline::slot_size(info.arch()) {
                size = align_up(size, trampoline::POOL_ALIGNMENT);
                size += trampolines * slot as usize;
            }
        }
        Ok(size)
    }

    /// Produce the final image in `dst`, assuming it will run at
    /// `base_address`.
    ///
    /// Sections are laid out in id order, copied, and every relocation
    /// entry is applied; out-of-range `Trampoline` relocations get a thunk
    /// appended after the last section. Returns the number of bytes of
    /// `dst` actually used, which may be less than [`CodeHolder::code_size`]
    /// when reserved trampoline space goes unused.
    ///
    /// On error the contents of `dst` are undefined but the holder is
    /// unchanged; every pending label must be bound first (`InvalidState`).
    pub fn relocate(&self, dst: &mut [u8], base_address: u64) -> AsmResult<usize> {
        relocate::relocate(self, dst, base_address)
    }

    // === Internals ===

    fn next_label_index(&self) -> AsmResult<u32> {
        let index = self.labels.len() as u32;
        if index >= MAX_LABEL_COUNT {
            return Err(Error::LabelIndexOverflow);
        }
        Ok(index)
    }

    fn find_named(&self, hash: u64, name: &str, parent: Option<Label>) -> Option<Label> {
        self.named_labels
            .find(hash, |&l| {
                let entry = &self.labels[l.index() as usize];
                entry.hash == hash && entry.parent == parent && entry.name == *name
            })
            .copied()
    }

    pub(crate) fn label_entry(&self, label: Label) -> AsmResult<&LabelEntry> {
        if !self.is_label_valid(label) {
            return Err(Error::InvalidLabel);
        }
        Ok(&self.labels[label.index() as usize])
    }
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
