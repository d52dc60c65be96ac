use super::dentry::Dentry;
use super::tables::{TID_TDT, TID_TOT};
use super::{fsutils, Error, ErrorDetails, Result, SliceReader, CRC};
use crate::read_bitfield;
use log::warn;
use modular_bitfield_msb::prelude::*;
use std::sync::Arc;

/// First three bytes common to every PSI section.
#[bitfield]
#[derive(Debug, Clone)]
pub struct PsiHeader {
    pub table_id: B8,
    pub section_syntax_indicator: bool,
    pub private_bit: bool,
    pub reserved_bits: B2,
    #[skip]
    pub unused_bits: B2,
    pub section_length: B10,
}

/// Five-byte table syntax block present when the section syntax indicator is set.
///
/// The extension field carries the transport_stream_id, program_number, network_id or
/// service_id depending on the table.
#[bitfield]
#[derive(Debug, Clone)]
pub struct PsiTableSyntax {
    pub table_id_extension: B16,
    pub reserved_bits: B2,
    pub version: B5,
    pub current_next_indicator: bool,
    pub section_num: B8,
    pub last_section_num: B8,
}

/// One complete, CRC-validated PSI section ready for table-specific parsing.
///
/// The body excludes the common prefix and the trailing CRC.
#[derive(Debug)]
pub struct Section {
    /// PID the section arrived on.
    pub pid: u16,
    /// Common three-byte header.
    pub header: PsiHeader,
    /// Table syntax block, absent for short-syntax sections such as TDT/TOT.
    pub syntax: Option<PsiTableSyntax>,
    /// Table payload bytes.
    pub body: Vec<u8>,
    /// Validated CRC32 value, absent for tables that do not carry one.
    pub crc: Option<u32>,
}

impl Section {
    /// Table id from the common header.
    pub fn table_id(&self) -> u8 {
        self.header.table_id()
    }

    /// Version number, or zero for short-syntax sections.
    pub fn version(&self) -> u8 {
        self.syntax.as_ref().map_or(0, PsiTableSyntax::version)
    }

    /// Table id extension, or zero for short-syntax sections.
    pub fn extension(&self) -> u16 {
        self.syntax
            .as_ref()
            .map_or(0, PsiTableSyntax::table_id_extension)
    }

    /// Section number within a multi-section table.
    pub fn section_number(&self) -> u8 {
        self.syntax.as_ref().map_or(0, PsiTableSyntax::section_num)
    }

    /// Last section number within a multi-section table.
    pub fn last_section_number(&self) -> u8 {
        self.syntax
            .as_ref()
            .map_or(0, PsiTableSyntax::last_section_num)
    }

    /// Current/next indicator; short-syntax sections are always current.
    pub fn current(&self) -> bool {
        self.syntax
            .as_ref()
            .map_or(true, PsiTableSyntax::current_next_indicator)
    }

    /// Composite table hash key, `(pid << 8) | table_id`.
    pub fn key(&self) -> u32 {
        (u32::from(self.pid) << 8) | u32::from(self.table_id())
    }

    /// Reader positioned at the start of the body.
    pub fn reader(&self) -> SliceReader<'_> {
        SliceReader::new(&self.body)
    }
}

/// Decodes the common section prefix, verifies the CRC where the table carries one, and
/// strips both from the body.
///
/// TDT sections have no CRC; TOT sections carry one despite using the short syntax.
pub(crate) fn parse_section(pid: u16, raw: &[u8]) -> Result<Section> {
    let mut reader = SliceReader::new(raw);
    let header = read_bitfield!(reader, PsiHeader);
    let section_length = header.section_length() as usize;
    if raw.len() < 3 + section_length {
        warn!("Short section on PID {:#06x}", pid);
        return Err(Error::new(0, ErrorDetails::BadPsiHeader));
    }
    let table_id = header.table_id();
    let has_syntax = header.section_syntax_indicator();
    let has_crc = if table_id == TID_TDT {
        false
    } else {
        has_syntax || table_id == TID_TOT
    };

    let syntax_len = if has_syntax { 5 } else { 0 };
    let crc_len = if has_crc { 4 } else { 0 };
    if section_length < syntax_len + crc_len {
        warn!("Insufficient section length on PID {:#06x}", pid);
        return Err(Error::new(0, ErrorDetails::BadPsiHeader));
    }

    let crc = if has_crc {
        let crc_offset = 3 + section_length - 4;
        let expected = u32::from_be_bytes(*SliceReader::new(&raw[crc_offset..]).read_array_ref::<4>()?);
        let actual = CRC.checksum(&raw[..crc_offset]);
        if expected != actual {
            warn!(
                "CRC mismatch for table {:#04x} on PID {:#06x}",
                table_id, pid
            );
            return Err(Error::new(crc_offset, ErrorDetails::PsiCrcMismatch));
        }
        Some(expected)
    } else {
        None
    };

    let syntax = if has_syntax {
        Some(read_bitfield!(reader, PsiTableSyntax))
    } else {
        None
    };
    let body = reader.read(section_length - syntax_len - crc_len)?.to_vec();

    Ok(Section {
        pid,
        header,
        syntax,
        body,
        crc,
    })
}

/// Appends the common header leaves shared by every parsed table directory.
///
/// `extension_name` names the table-specific meaning of the table id extension field.
pub(crate) fn append_header_leaves(
    vdir: &Arc<Dentry>,
    section: &Section,
    extension_name: &str,
) -> Result<()> {
    fsutils::append_u8(vdir, "table_id", section.table_id())?;
    fsutils::append_flag(
        vdir,
        "section_syntax_indicator",
        section.header.section_syntax_indicator(),
    )?;
    fsutils::append_u16(vdir, "section_length", section.header.section_length())?;
    if let Some(syntax) = &section.syntax {
        fsutils::append_u16(vdir, extension_name, syntax.table_id_extension())?;
        fsutils::append_u8(vdir, "version_number", syntax.version())?;
        fsutils::append_flag(vdir, "current_next_indicator", syntax.current_next_indicator())?;
        fsutils::append_u8(vdir, "section_number", syntax.section_num())?;
        fsutils::append_u8(vdir, "last_section_number", syntax.last_section_num())?;
    }
    if let Some(crc) = section.crc {
        fsutils::append_u32(vdir, "crc_32", crc)?;
    }
    Ok(())
}
