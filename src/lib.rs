//! Runtime machine-code assembly library.
//!
//! This crate is the core of a just-in-time assembler: a [`CodeHolder`]
//! collects sections, labels, and relocations while emitters stream
//! instruction bytes into it; the relocation engine turns the finished
//! logical image into exact bytes at a chosen base address, synthesizing
//! trampolines for out-of-range relative references; and the
//! [`JitAllocator`] manages pools of executable memory with cache-line
//! granularity so the result can be installed and called.
//!
//! The typical flow:
//!
//! ```
//! use jitforge::{Assembler, CodeHolder, CodeInfo, Emitter};
//!
//! let mut holder = CodeHolder::with_info(CodeInfo::host().unwrap());
//! let mut asm = Assembler::new(&mut holder).unwrap();
//! let skipped = asm.new_label().unwrap();
//! asm.emit_bytes(&[0xEB]).unwrap(); // jmp rel8
//! asm.emit_label_displacement(skipped, 1, 0).unwrap();
//! asm.emit_bytes(&[0x90, 0x90]).unwrap();
//! asm.bind(skipped).unwrap();
//! drop(asm);
//! assert_eq!(holder.unresolved_label_count(), 0);
//! ```
//!
//! Architecture instruction encoders are deliberately out of scope; they
//! sit on top of the [`Emitter`] surface and the holder's label, link, and
//! relocation operations.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub mod assembler;
pub mod buffer;
pub mod const_pool;
pub mod emitter;
pub mod holder;
pub mod jit_allocator;
pub mod label;
pub mod reloc;
pub mod runtime;
pub mod section;
pub mod target;
pub mod vm;
pub mod zone;

mod relocate;
mod result;
mod strings;
mod trampoline;

pub use crate::assembler::Assembler;
pub use crate::buffer::{CodeBuffer, CodeOffset};
pub use crate::const_pool::ConstPool;
pub use crate::emitter::{AlignMode, Emitter, EmitterKind};
pub use crate::holder::{CodeHolder, ErrorHandler};
pub use crate::jit_allocator::{JitAllocator, JitAllocatorOptions};
pub use crate::label::{Label, LabelType};
pub use crate::reloc::{RelocEntry, RelocKind};
pub use crate::result::{AsmResult, Error};
pub use crate::runtime::JitRuntime;
pub use crate::section::{Section, SectionFlags};
pub use crate::strings::SmallString;
pub use crate::target::{CallConv, CodeInfo, NO_BASE_ADDRESS};
pub use crate::zone::Zone;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
