//! # Command Blocks
//!
//! Storage transports hand their I/O requests over as command blocks. The
//! loader pulls the data description out of the block and runs the matching
//! load path.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::context::BusDma;
use crate::load::{AddressSpace, IoVec, push_linear};
use crate::md::MdId;
use crate::{BusDmaError, ContiguousAlloc, DmaFlags, PageTableWalker};
use log::debug;

/// Transport function code of a command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandFunction {
    ScsiIo,
    AtaIo,
    NvmeIo,
    /// Any other function code; carries no data the loader understands.
    Other(u8),
}

/// Direction of the data phase.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DataDirection {
    /// No data phase.
    None,
    /// Device to memory.
    In,
    /// Memory to device.
    Out,
    Both,
}

/// One physical range of a pre-built physical scatter list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysicalRange {
    pub addr: PhysicalAddress,
    pub len: u64,
}

/// Data description carried by a command block.
#[derive(Copy, Clone, Debug)]
pub enum CommandData<'a> {
    /// Kernel virtual buffer.
    Virtual { addr: VirtualAddress, len: u64 },
    /// Physically contiguous buffer.
    Physical { addr: PhysicalAddress, len: u64 },
    /// Pre-built scatter list of kernel virtual ranges.
    ScatterList(&'a [IoVec]),
    /// Pre-built scatter list of physical ranges.
    PhysicalScatterList(&'a [PhysicalRange]),
    /// Data held by a buffer object the loader cannot walk.
    Unmapped,
}

impl CommandData<'_> {
    /// Total bytes described.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Virtual { len, .. } | Self::Physical { len, .. } => *len,
            Self::ScatterList(list) => list.iter().fold(0, |n, v| n.saturating_add(v.len)),
            Self::PhysicalScatterList(list) => {
                list.iter().fold(0, |n, r| n.saturating_add(r.len))
            }
            Self::Unmapped => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A structured I/O request.
#[derive(Copy, Clone, Debug)]
pub struct CommandBlock<'a> {
    pub function: CommandFunction,
    pub direction: DataDirection,
    pub data: CommandData<'a>,
}

impl<W: PageTableWalker, A: ContiguousAlloc> BusDma<W, A> {
    /// Load the data buffer of a command block.
    ///
    /// A command without a data phase, or with no bytes, succeeds and leaves
    /// the descriptor empty.
    ///
    /// # Errors
    /// - [`BusDmaError::Unsupported`]: unknown function code or unmapped data.
    /// - Otherwise as the matching load path
    ///   ([`md_load_linear`](Self::md_load_linear),
    ///   [`md_load_physical`](Self::md_load_physical)).
    pub fn md_load_command_block(
        &self,
        md: MdId,
        block: &CommandBlock<'_>,
        flags: DmaFlags,
    ) -> Result<(), BusDmaError> {
        if let CommandFunction::Other(code) = block.function {
            debug!("md_load_command_block: function {code:#04x} not supported");
            return Err(BusDmaError::Unsupported("command function"));
        }

        if matches!(block.data, CommandData::Unmapped) {
            return Err(BusDmaError::Unsupported("unmapped command data"));
        }

        if block.direction == DataDirection::None || block.data.is_empty() {
            let mds = self.mds.lock();
            let node = mds.get(md)?;
            if node.flags.allocated() || node.flags.loaded() {
                return Err(BusDmaError::InvalidArgument("descriptor is already loaded"));
            }
            debug!("md_load_command_block: {md:?} has no data phase");
            return Ok(());
        }

        let page_size = self.config.page_size;
        match block.data {
            CommandData::Virtual { addr, len } => {
                self.md_load_linear(md, AddressSpace::Kernel, addr, len, flags)
            }
            CommandData::Physical { addr, len } => self.md_load_physical(md, addr, len, flags),
            CommandData::ScatterList(list) => {
                self.load_with(md, flags, "md_load_command_block", |seg| {
                    for iov in list.iter().filter(|v| v.len != 0) {
                        push_linear(seg, &self.walker, page_size, iov.base, iov.len)?;
                    }
                    Ok(())
                })
            }
            CommandData::PhysicalScatterList(list) => {
                self.load_with(md, flags, "md_load_command_block", |seg| {
                    for range in list {
                        seg.push(range.addr, None, range.len)?;
                    }
                    Ok(())
                })
            }
            CommandData::Unmapped => Err(BusDmaError::Unsupported("unmapped command data")),
        }
    }
}
