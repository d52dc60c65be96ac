//! Library for demultiplexing ISDB-Tb MPEG transport streams into a browsable virtual
//! filesystem tree.
//!
//! Feed raw transport stream bytes to a [`TsDemuxer`] and every PSI/SI table it recognises
//! (PAT, PMT, NIT, SDT, EIT, TDT/TOT, DSM-CC download signalling, ...) becomes a directory
//! tree of parsed field values: numeric leaves hold decimal content with hexadecimal and
//! binary renderings in extended attributes, inter-table references become symlinks, and
//! each table version is published under a `Vnn` directory beside a `Current` symlink.
//! The tree is safe to read from other threads while ingestion is running; superseded
//! version directories stay alive until the last reader drops its handle.
//!
//! # Usage
//! Simply add this crate as a dependency in your `Cargo.toml`.
//!
//! ```toml
//! [dependencies]
//! mpegts-fs = "~0.1.0"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mpegts_fs::TsDemuxer;
//! use std::fs::File;
//! use std::io::Read;
//!
//! let mut file = File::open("capture.ts").expect("unable to open!");
//! let mut demuxer = TsDemuxer::new();
//! let mut buffer = [0_u8; 64 * 188];
//! loop {
//!     let read = file.read(&mut buffer).expect("IO Error!");
//!     if read == 0 {
//!         break;
//!     }
//!     demuxer.feed(&buffer[..read]);
//! }
//! let root = demuxer.root();
//! if let Some(current) = root.walk("PAT/Current") {
//!     println!("PAT version dir: {}", current.path());
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/mpegts-fs/0.1.0")]
#![allow(unused)]
#![deny(missing_docs, unsafe_code, warnings)]

use crc::{Crc, CRC_32_MPEG_2};
use log::{debug, warn};
use modular_bitfield_msb::prelude::*;
use std::collections::HashMap;
use std::result;
use std::sync::Arc;

mod slice_reader;
pub use slice_reader::SliceReader;

mod dentry;
pub use dentry::{Dentry, DentryContent};

pub mod fsutils;

mod payload_unit;
use payload_unit::SectionQueue;

mod psi;
pub use psi::{PsiHeader, PsiTableSyntax, Section};

pub mod tables;
use tables::{TableParse, TableStore};
pub use tables::descriptors::{Descriptor, DescriptorDecoder, DescriptorRegistry};
pub use tables::{GenericParser, PesEntry, TableParser};

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/* PID carrying only null stuffing packets */
const PID_NULL: u16 = 0x1fff;

/// Computes the CRC32 used by PSI sections (polynomial 0x04C11DB7, initial 0xFFFFFFFF, no
/// reflection, no final XOR).
pub fn crc32(data: &[u8]) -> u32 {
    CRC.checksum(data)
}

/// Errors that may be encountered while parsing a transport stream.
///
/// Parse failures never escape [`TsDemuxer::feed`]; the offending packet or section is
/// dropped, counted in [`DemuxStats`], and logged at warning level.
#[derive(Debug)]
pub enum ErrorDetails {
    /// Encountered when a [`SliceReader`] reads out of bounds.
    /// The [`usize`] parameter is the length of the offending read.
    PacketOverrun(usize),
    /// MPEG-TS packet headers must contain a sync byte of 0x47.
    /// This is the error when encountering any other value.
    LostSync,
    /// Encountered for inconsistent adaptation field parses.
    BadAdaptationHeader,
    /// Encountered for inconsistent PSI section header parses.
    BadPsiHeader,
    /// Encountered when a PSI section fails CRC check.
    PsiCrcMismatch,
    /// Encountered for inconsistent DSM-CC message headers.
    BadDsmccHeader,
    /// Encountered when inserting a dentry whose name already exists among its siblings.
    DentryCollision(String),
}

/// Error type encapsulating all possible parser errors.
#[derive(Debug)]
pub struct Error {
    /// Byte index within the packet or section that the error was encountered.
    pub location: usize,
    /// Information about the error.
    pub details: ErrorDetails,
}

impl Error {
    /// Creates an error at an explicit location.
    pub fn new(location: usize, details: ErrorDetails) -> Self {
        Self { location, details }
    }
}

/// [`std::result::Result`] alias that uses [`Error`].
pub type Result<T> = result::Result<T, Error>;

/// TSC information used in a packet's payload.
#[repr(u8)]
#[derive(Debug, BitfieldSpecifier)]
#[bits = 2]
pub enum TransportScramblingControl {
    /// Not scrambled.
    NotScrambled,
    /// Do not use.
    Reserved,
    /// Scrambled with even key.
    ScrambledEvenKey,
    /// Scrambled with odd key.
    ScrambledOddKey,
}

/// Link-layer header found at the start of every 188-byte MPEG-TS packet.
#[bitfield]
#[derive(Debug)]
pub struct PacketHeader {
    pub sync_byte: B8,
    pub tei: bool,
    pub pusi: bool,
    pub priority: bool,
    pub pid: B13,
    pub tsc: TransportScramblingControl,
    pub has_adaptation_field: bool,
    pub has_payload: bool,
    pub continuity_counter: B4,
}

/// Flag byte following the adaptation field length.
#[bitfield]
#[derive(Debug)]
pub struct AdaptationFlags {
    pub discontinuity: bool,
    pub random_access: bool,
    pub priority: bool,
    pub has_pcr: bool,
    pub has_opcr: bool,
    pub has_splice_countdown: bool,
    pub has_transport_private_data: bool,
    pub has_adaptation_field_extension: bool,
}

/// Ingestion counters, updated as [`TsDemuxer::feed`] consumes the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct DemuxStats {
    /// Packets handed to the packet parser.
    pub packets: u64,
    /// Packets dropped for malformed headers.
    pub dropped_packets: u64,
    /// Bytes skipped while searching for the sync byte.
    pub resync_bytes: u64,
    /// Complete sections released by the reassembler.
    pub sections: u64,
    /// Sections dropped for CRC or parse failures.
    pub dropped_sections: u64,
}

/* Per-PID ingestion state: continuity tracking plus the reassembly queue */
struct PidState {
    continuity: Option<u8>,
    queue: SectionQueue,
}

impl Default for PidState {
    fn default() -> Self {
        Self {
            continuity: None,
            queue: SectionQueue::new(),
        }
    }
}

/// Transport stream demultiplexer feeding the virtual filesystem tree.
///
/// A single ingestion thread drives [`TsDemuxer::feed`]; the produced dentry tree, obtained
/// through [`TsDemuxer::root`], may be read concurrently by any number of threads. Dropping
/// the demuxer releases the tree; subtrees still referenced by readers survive until those
/// references are dropped.
pub struct TsDemuxer {
    root: Arc<Dentry>,
    tables: TableStore,
    registry: DescriptorRegistry,
    pids: HashMap<u16, PidState>,
    partial: Vec<u8>,
    packet_size: usize,
    stats: DemuxStats,
}

impl Default for TsDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsDemuxer {
    /// Creates a demuxer for plain 188-byte packets, with the reserved PIDs registered.
    pub fn new() -> Self {
        Self::with_packet_size(188)
    }

    /// Creates a demuxer for 192-byte packets carrying a four-byte timestamp prefix, as
    /// recorded by ISDB receivers. The prefix is stripped before parsing.
    pub fn new_timestamped() -> Self {
        Self::with_packet_size(192)
    }

    fn with_packet_size(packet_size: usize) -> Self {
        let tables = TableStore::new();
        tables::seed_reserved(&tables);
        Self {
            root: Dentry::new_root(),
            tables,
            registry: DescriptorRegistry::default(),
            pids: HashMap::new(),
            partial: Vec::new(),
            packet_size,
            stats: DemuxStats::default(),
        }
    }

    /// Handle to the tree root, cheap to clone and safe to share with reader threads.
    pub fn root(&self) -> Arc<Dentry> {
        self.root.clone()
    }

    /// Snapshot of the ingestion counters.
    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    /// The parser registered for a PID, if any.
    pub fn psi_parser(&self, pid: u16) -> Option<TableParser> {
        self.tables.psi_parser(pid)
    }

    /// The elementary stream registration announced by a PMT for a PID, if any.
    pub fn pes_parser(&self, pid: u16) -> Option<PesEntry> {
        self.tables.pes_parser(pid)
    }

    /// Binds a parser to a PID, replacing any previous registration.
    pub fn register_psi_parser(&self, pid: u16, parser: TableParser) {
        self.tables.register_psi(pid, parser);
    }

    /// Mutable access to the descriptor decoder registry for plugging in additional tags.
    pub fn descriptor_registry_mut(&mut self) -> &mut DescriptorRegistry {
        &mut self.registry
    }

    pub(crate) fn tables(&self) -> &TableStore {
        &self.tables
    }

    pub(crate) fn descriptors(&self) -> &DescriptorRegistry {
        &self.registry
    }

    /// Consumes a chunk of the input byte stream.
    ///
    /// The chunk need not be packet-aligned: partial packets are buffered, and the engine
    /// resynchronises on the 0x47 sync byte after corruption. Malformed packets and
    /// sections are dropped and counted, never surfaced as errors.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        let mut offset = 0;
        let mut skipped: u64 = 0;
        while self.partial.len() - offset >= self.packet_size {
            /* Timestamped captures prepend four bytes before each 188-byte packet */
            let sync_offset = offset + self.packet_size - 188;
            if self.partial[sync_offset] != 0x47 {
                offset += 1;
                skipped += 1;
                continue;
            }
            let mut packet = [0_u8; 188];
            packet.copy_from_slice(&self.partial[sync_offset..sync_offset + 188]);
            self.stats.packets += 1;
            if let Err(error) = self.parse_packet(&packet) {
                self.stats.dropped_packets += 1;
                warn!("Dropping packet: {:?}", error);
            }
            offset += self.packet_size;
        }
        if skipped > 0 {
            self.stats.resync_bytes += skipped;
            warn!("Skipped {} bytes while resynchronising", skipped);
        }
        self.partial.drain(..offset);
    }

    fn parse_packet(&mut self, packet: &[u8; 188]) -> Result<()> {
        let mut reader = SliceReader::new(packet);
        let header = read_bitfield!(reader, PacketHeader);
        if header.sync_byte() != 0x47 {
            return Err(reader.make_error(ErrorDetails::LostSync));
        }

        let pid = header.pid();
        if pid == PID_NULL {
            return Ok(());
        }
        if header.tei() {
            debug!("Dropping packet flagged with transport errors on PID {:#06x}", pid);
            return Ok(());
        }

        let mut discontinuity = false;
        if header.has_adaptation_field() {
            let adaptation_field_length = reader.read_u8()? as usize;
            if adaptation_field_length > 183 {
                warn!("Bad adaptation field length on PID {:#06x}", pid);
                return Err(reader.make_error(ErrorDetails::BadAdaptationHeader));
            }
            if adaptation_field_length > 0 {
                let mut a_reader = reader.new_sub_reader(adaptation_field_length)?;
                let flags = read_bitfield!(a_reader, AdaptationFlags);
                discontinuity = flags.discontinuity();
            }
        }
        if !header.has_payload() {
            return Ok(());
        }

        /* Only PIDs with a registered parser are of interest */
        let parser = match self.tables.psi_parser(pid) {
            Some(parser) => parser,
            None => return Ok(()),
        };
        if !matches!(header.tsc(), TransportScramblingControl::NotScrambled) {
            warn!("Dropping scrambled payload on PSI PID {:#06x}", pid);
            return Ok(());
        }

        let payload = reader.read_to_end()?;
        let sections = {
            let state = self.pids.entry(pid).or_default();
            if let Some(previous) = state.continuity {
                let expected = (previous + 1) & 0x0f;
                if header.continuity_counter() != expected && !discontinuity {
                    warn!(
                        "Continuity jump on PID {:#06x}, dropping section in progress",
                        pid
                    );
                    state.queue.reset();
                }
            }
            state.continuity = Some(header.continuity_counter());
            match state.queue.accept(header.pusi(), pid, payload) {
                Ok(sections) => sections,
                Err(error) => {
                    state.queue.reset();
                    return Err(error);
                }
            }
        };

        for raw in sections {
            self.stats.sections += 1;
            if let Err(error) = self.handle_section(pid, parser, &raw) {
                self.stats.dropped_sections += 1;
                warn!("Dropping section on PID {:#06x}: {:?}", pid, error);
            }
        }
        Ok(())
    }

    fn handle_section(&self, pid: u16, parser: TableParser, raw: &[u8]) -> Result<()> {
        let section = psi::parse_section(pid, raw)?;
        let table_id = section.table_id();
        if table_id == tables::TID_ST {
            debug!("Ignoring stuffing table on PID {:#06x}", pid);
            return Ok(());
        }
        if !parser.accepts(table_id) {
            debug!(
                "No parser claims table {:#04x} on PID {:#06x}",
                table_id, pid
            );
            return Ok(());
        }
        parser.parse(self, section)
    }
}
