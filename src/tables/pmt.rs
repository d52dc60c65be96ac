//! Program Map Table parsing: per-program stream directories and media PID registration.

use super::dsmcc::DsmccParser;
use super::{commit, Disposition, GenericParser, TableParse, TID_PMT};
use crate::psi::{self, Section};
use crate::tables::PesEntry;
use crate::{fsutils, Result, TsDemuxer};
use log::debug;
use modular_bitfield_msb::prelude::*;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Fixed PMT body prefix carrying the PCR PID and the program info length.
#[bitfield]
#[derive(Debug)]
pub struct PmtHeader {
    pub reserved: B3,
    pub pcr_pid: B13,
    pub reserved2: B4,
    #[skip]
    pub unused_bits: B2,
    pub program_info_length: B10,
}

/// Five-byte elementary stream entry header.
#[bitfield]
#[derive(Debug)]
pub struct EsInfoHeader {
    pub stream_type: B8,
    pub reserved: B3,
    pub elementary_pid: B13,
    pub reserved2: B4,
    #[skip]
    pub unused_bits: B2,
    pub es_info_length: B10,
}

/// Well-known elementary stream type codes.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, FromPrimitive)]
pub enum StreamType {
    /// ISO/IEC 11172-2 video.
    Mpeg1Video = 0x01,
    /// ITU-T H.262 video.
    Mpeg2Video = 0x02,
    /// ISO/IEC 11172-3 audio.
    Mpeg1Audio = 0x03,
    /// ISO/IEC 13818-3 audio.
    Mpeg2Audio = 0x04,
    /// Private sections.
    PrivateSections = 0x05,
    /// PES packets with private data.
    PrivateData = 0x06,
    /// DSM-CC type A multiprotocol encapsulation.
    DsmccTypeA = 0x0a,
    /// DSM-CC type B download messages (object carousel).
    DsmccTypeB = 0x0b,
    /// DSM-CC type C stream descriptors.
    DsmccTypeC = 0x0c,
    /// DSM-CC type D sections.
    DsmccTypeD = 0x0d,
    /// ISO/IEC 13818-7 audio (ADTS).
    AdtsAudio = 0x0f,
    /// ISO/IEC 14496-3 audio (LATM).
    LatmAudio = 0x11,
    /// ITU-T H.264 video.
    H264Video = 0x1b,
    /// ITU-T H.265 video.
    H265Video = 0x24,
}

impl StreamType {
    fn description(self) -> &'static str {
        match self {
            StreamType::Mpeg1Video => "ISO/IEC 11172-2 Video",
            StreamType::Mpeg2Video => "ITU-T H.262 Video",
            StreamType::Mpeg1Audio => "ISO/IEC 11172-3 Audio",
            StreamType::Mpeg2Audio => "ISO/IEC 13818-3 Audio",
            StreamType::PrivateSections => "Private Sections",
            StreamType::PrivateData => "PES Private Data",
            StreamType::DsmccTypeA => "DSM-CC Multiprotocol Encapsulation",
            StreamType::DsmccTypeB => "DSM-CC U-N Messages",
            StreamType::DsmccTypeC => "DSM-CC Stream Descriptors",
            StreamType::DsmccTypeD => "DSM-CC Sections",
            StreamType::AdtsAudio => "ISO/IEC 13818-7 Audio (ADTS)",
            StreamType::LatmAudio => "ISO/IEC 14496-3 Audio (LATM)",
            StreamType::H264Video => "ITU-T H.264 Video",
            StreamType::H265Video => "ITU-T H.265 Video",
        }
    }

    fn carries_sections(self) -> bool {
        matches!(
            self,
            StreamType::DsmccTypeB | StreamType::DsmccTypeC | StreamType::DsmccTypeD
        )
    }
}

/* application_signalling descriptor announces an AIT on the stream's PID */
const TAG_APPLICATION_SIGNALLING: u8 = 0x6f;

/// Parser for Program Map Tables (table id 0x02).
///
/// Each PMT PID gets its own directory under `/PMT`, so the PAT's per-program symlinks
/// resolve to `/PMT/0xNNNN/Current`. Announced elementary PIDs are recorded in the PES
/// registry; DSM-CC streams additionally get the section parser bound to their PID.
#[derive(Debug, Clone, Copy, Default)]
pub struct PmtParser;

impl TableParse for PmtParser {
    fn accepts(&self, table_id: u8) -> bool {
        table_id == TID_PMT
    }

    fn parse(&self, demuxer: &TsDemuxer, section: Section) -> Result<()> {
        if !section.current() {
            debug!("Ignoring not-yet-applicable PMT on PID {:#06x}", section.pid);
            return Ok(());
        }
        let disposition = demuxer.tables().disposition(
            section.key(),
            section.version(),
            section.section_number(),
        );
        if matches!(disposition, Disposition::Skip) {
            debug!(
                "Ignoring already-known PMT version {} on PID {:#06x}",
                section.version(),
                section.pid
            );
            return Ok(());
        }

        let mut reader = section.reader();
        let header = crate::read_bitfield!(reader, PmtHeader);

        let vdir = fsutils::create_version_dir(section.version());
        psi::append_header_leaves(&vdir, &section, "program_number")?;
        fsutils::append_u16(&vdir, "pcr_pid", header.pcr_pid())?;

        let mut info_reader = reader.new_sub_reader(header.program_info_length() as usize)?;
        let program_info = fsutils::ensure_dir(&vdir, "ProgramInformation")?;
        demuxer
            .descriptors()
            .decode_loop(&mut info_reader, &program_info)?;

        let streams = fsutils::ensure_dir(&vdir, "Streams")?;
        while reader.remaining_len() > 0 {
            let es_header = crate::read_bitfield!(reader, EsInfoHeader);
            let pid = es_header.elementary_pid();
            let stream_dir = fsutils::ensure_dir(&streams, &format!("0x{:04x}", pid))?;
            fsutils::append_u8(&stream_dir, "stream_type", es_header.stream_type())?;
            let stream_type = StreamType::from_u8(es_header.stream_type());
            if let Some(known) = stream_type {
                fsutils::append_string(&stream_dir, "stream_type_description", known.description())?;
            }

            let mut es_reader = reader.new_sub_reader(es_header.es_info_length() as usize)?;
            let es_info = fsutils::ensure_dir(&stream_dir, "Descriptors")?;
            let descriptors = demuxer.descriptors().decode_loop(&mut es_reader, &es_info)?;

            demuxer.tables().register_pes(PesEntry {
                pid,
                stream_type: es_header.stream_type(),
            });
            if stream_type.map_or(false, StreamType::carries_sections) {
                demuxer
                    .tables()
                    .register_psi_if_absent(pid, DsmccParser::default().into());
            }
            if descriptors
                .iter()
                .any(|d| d.tag == TAG_APPLICATION_SIGNALLING)
            {
                demuxer
                    .tables()
                    .register_psi_if_absent(pid, GenericParser::new("AIT").into());
            }
        }

        let pmt_root = fsutils::ensure_dir(&demuxer.root(), "PMT")?;
        let table_root = fsutils::ensure_dir(&pmt_root, &format!("0x{:04x}", section.pid))?;
        commit(demuxer, &table_root, vdir, &section, disposition)
    }
}
