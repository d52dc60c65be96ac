//! DSM-CC U-N download signalling: DownloadInfoIndication and DownloadDataBlock messages
//! carried in private sections (table ids 0x3B/0x3C).

use super::{commit, Disposition, TableParse, TID_DDB, TID_DII};
use crate::dentry::Dentry;
use crate::psi::{self, Section};
use crate::{fsutils, Error, ErrorDetails, Result, SliceReader, TsDemuxer};
use log::debug;
use modular_bitfield_msb::prelude::*;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::sync::Arc;

/* DSM-CC messages always open with this discriminator */
const PROTOCOL_DISCRIMINATOR: u8 = 0x11;

/// Twelve-byte header opening a DSM-CC U-N control message.
#[bitfield]
#[derive(Debug)]
pub struct DsmccMessageHeader {
    pub protocol_discriminator: B8,
    pub dsmcc_type: B8,
    pub message_id: B16,
    pub transaction_id: B32,
    pub reserved: B8,
    pub adaptation_length: B8,
    pub message_length: B16,
}

/// Twelve-byte header opening a DSM-CC download data message; the transaction id slot
/// carries the download id instead.
#[bitfield]
#[derive(Debug)]
pub struct DsmccDataHeader {
    pub protocol_discriminator: B8,
    pub dsmcc_type: B8,
    pub message_id: B16,
    pub download_id: B32,
    pub reserved: B8,
    pub adaptation_length: B8,
    pub message_length: B16,
}

/// Well-known DSM-CC U-N message ids.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, FromPrimitive)]
pub enum DsmccMessageId {
    /// DownloadInfoRequest.
    DownloadInfoRequest = 0x1001,
    /// DownloadInfoIndication.
    DownloadInfoIndication = 0x1002,
    /// DownloadDataBlock.
    DownloadDataBlock = 0x1003,
    /// DownloadDataRequest.
    DownloadDataRequest = 0x1004,
    /// DownloadCancel.
    DownloadCancel = 0x1005,
    /// DownloadServerInitiate.
    DownloadServerInitiate = 0x1006,
}

impl DsmccMessageId {
    fn name(self) -> &'static str {
        match self {
            DsmccMessageId::DownloadInfoRequest => "DownloadInfoRequest",
            DsmccMessageId::DownloadInfoIndication => "DownloadInfoIndication",
            DsmccMessageId::DownloadDataBlock => "DownloadDataBlock",
            DsmccMessageId::DownloadDataRequest => "DownloadDataRequest",
            DsmccMessageId::DownloadCancel => "DownloadCancel",
            DsmccMessageId::DownloadServerInitiate => "DownloadServerInitiate",
        }
    }
}

/// Parser for DSM-CC DII/DDB sections.
///
/// Each carrying PID gets `/DSM-CC/0xNNNN/DII` and `/DSM-CC/0xNNNN/DDB` subtrees, versioned
/// like any other table through the section syntax version field.
#[derive(Debug, Clone, Copy, Default)]
pub struct DsmccParser;

impl TableParse for DsmccParser {
    fn accepts(&self, table_id: u8) -> bool {
        matches!(table_id, TID_DII | TID_DDB)
    }

    fn parse(&self, demuxer: &TsDemuxer, section: Section) -> Result<()> {
        if !section.current() {
            debug!("Ignoring not-yet-applicable DSM-CC section");
            return Ok(());
        }
        let disposition = demuxer.tables().disposition(
            section.key(),
            section.version(),
            section.section_number(),
        );
        if matches!(disposition, Disposition::Skip) {
            debug!(
                "Ignoring already-known DSM-CC version {} on PID {:#06x}",
                section.version(),
                section.pid
            );
            return Ok(());
        }

        let vdir = fsutils::create_version_dir(section.version());
        psi::append_header_leaves(&vdir, &section, "table_id_extension")?;

        let mut reader = section.reader();
        let kind = if section.table_id() == TID_DII {
            append_dii(&mut reader, &vdir)?;
            "DII"
        } else {
            append_ddb(&mut reader, &vdir)?;
            "DDB"
        };

        let dsmcc_root = fsutils::ensure_dir(&demuxer.root(), "DSM-CC")?;
        let pid_root = fsutils::ensure_dir(&dsmcc_root, &format!("0x{:04x}", section.pid))?;
        let table_root = fsutils::ensure_dir(&pid_root, kind)?;
        commit(demuxer, &table_root, vdir, &section, disposition)
    }
}

fn check_discriminator(value: u8, location: usize) -> Result<()> {
    if value != PROTOCOL_DISCRIMINATOR {
        debug!("Bad DSM-CC protocol discriminator {:#04x}", value);
        return Err(Error::new(location, ErrorDetails::BadDsmccHeader));
    }
    Ok(())
}

fn append_message_name(dir: &Arc<Dentry>, message_id: u16) -> Result<()> {
    if let Some(known) = DsmccMessageId::from_u16(message_id) {
        fsutils::append_string(dir, "message_name", known.name())?;
    }
    Ok(())
}

fn append_adaptation(
    reader: &mut SliceReader,
    dir: &Arc<Dentry>,
    adaptation_length: u8,
) -> Result<()> {
    if adaptation_length == 0 {
        return Ok(());
    }
    let mut adaptation = reader.new_sub_reader(adaptation_length as usize)?;
    fsutils::append_u8(dir, "adaptation_type", adaptation.read_u8()?)?;
    let data = adaptation.read_to_end()?;
    if !data.is_empty() {
        fsutils::append_binary(dir, "adaptation_data", data)?;
    }
    Ok(())
}

fn append_dii(reader: &mut SliceReader, vdir: &Arc<Dentry>) -> Result<()> {
    let header = crate::read_bitfield!(reader, DsmccMessageHeader);
    check_discriminator(header.protocol_discriminator(), 0)?;

    let header_dir = fsutils::ensure_dir(vdir, "MessageHeader")?;
    fsutils::append_u8(&header_dir, "protocol_discriminator", header.protocol_discriminator())?;
    fsutils::append_u8(&header_dir, "dsmcc_type", header.dsmcc_type())?;
    fsutils::append_u16(&header_dir, "message_id", header.message_id())?;
    append_message_name(&header_dir, header.message_id())?;
    fsutils::append_u32(&header_dir, "transaction_id", header.transaction_id())?;
    fsutils::append_u8(&header_dir, "adaptation_length", header.adaptation_length())?;
    fsutils::append_u16(&header_dir, "message_length", header.message_length())?;
    append_adaptation(reader, &header_dir, header.adaptation_length())?;

    fsutils::append_u32(vdir, "download_id", reader.read_be_u32()?)?;
    fsutils::append_u16(vdir, "block_size", reader.read_be_u16()?)?;
    fsutils::append_u8(vdir, "window_size", reader.read_u8()?)?;
    fsutils::append_u8(vdir, "ack_period", reader.read_u8()?)?;
    fsutils::append_u32(vdir, "t_c_download_window", reader.read_be_u32()?)?;
    fsutils::append_u32(vdir, "t_c_download_scenario", reader.read_be_u32()?)?;

    append_compatibility_descriptor(reader, vdir)?;

    let number_of_modules = reader.read_be_u16()?;
    fsutils::append_u16(vdir, "number_of_modules", number_of_modules)?;
    let modules = fsutils::ensure_dir(vdir, "Modules")?;
    for _ in 0..number_of_modules {
        let module_id = reader.read_be_u16()?;
        let module_size = reader.read_be_u32()?;
        let module_version = reader.read_u8()?;
        let module_dir = fsutils::ensure_dir(&modules, &format!("0x{:04x}", module_id))?;
        fsutils::append_u16(&module_dir, "module_id", module_id)?;
        fsutils::append_u32(&module_dir, "module_size", module_size)?;
        fsutils::append_u8(&module_dir, "module_version", module_version)?;
        let module_info_length = reader.read_u8()? as usize;
        if module_info_length > 0 {
            fsutils::append_binary(&module_dir, "module_info", reader.read(module_info_length)?)?;
        }
    }

    let private_data_length = reader.read_be_u16()? as usize;
    if private_data_length > 0 {
        fsutils::append_binary(vdir, "private_data", reader.read(private_data_length)?)?;
    }
    Ok(())
}

fn append_ddb(reader: &mut SliceReader, vdir: &Arc<Dentry>) -> Result<()> {
    let header = crate::read_bitfield!(reader, DsmccDataHeader);
    check_discriminator(header.protocol_discriminator(), 0)?;

    let header_dir = fsutils::ensure_dir(vdir, "DownloadDataHeader")?;
    fsutils::append_u8(&header_dir, "protocol_discriminator", header.protocol_discriminator())?;
    fsutils::append_u8(&header_dir, "dsmcc_type", header.dsmcc_type())?;
    fsutils::append_u16(&header_dir, "message_id", header.message_id())?;
    append_message_name(&header_dir, header.message_id())?;
    fsutils::append_u32(&header_dir, "download_id", header.download_id())?;
    fsutils::append_u8(&header_dir, "adaptation_length", header.adaptation_length())?;
    fsutils::append_u16(&header_dir, "message_length", header.message_length())?;
    append_adaptation(reader, &header_dir, header.adaptation_length())?;

    fsutils::append_u16(vdir, "module_id", reader.read_be_u16()?)?;
    fsutils::append_u8(vdir, "module_version", reader.read_u8()?)?;
    reader.skip(1)?;
    fsutils::append_u16(vdir, "block_number", reader.read_be_u16()?)?;
    let data = reader.read_to_end()?;
    fsutils::append_binary(vdir, "data", data)?;
    Ok(())
}

/// Appends the nested `CompatibilityDescriptor` tree, mirroring the wire structure with one
/// `descriptor_NN` directory per descriptor and `sub_descriptor_MM` children below it.
fn append_compatibility_descriptor(reader: &mut SliceReader, parent: &Arc<Dentry>) -> Result<()> {
    let dir = fsutils::ensure_dir(parent, "CompatibilityDescriptor")?;
    let length = reader.read_be_u16()?;
    fsutils::append_u16(&dir, "compatibility_descriptor_length", length)?;
    let mut body = reader.new_sub_reader(length as usize)?;
    if length == 0 {
        return Ok(());
    }

    let descriptor_count = body.read_be_u16()?;
    fsutils::append_u16(&dir, "descriptor_count", descriptor_count)?;
    for index in 1..=descriptor_count {
        let entry = fsutils::ensure_dir(&dir, &format!("descriptor_{:02}", index))?;
        fsutils::append_u8(&entry, "descriptor_type", body.read_u8()?)?;
        let descriptor_length = body.read_u8()? as usize;
        let mut descriptor = body.new_sub_reader(descriptor_length)?;
        fsutils::append_u8(&entry, "specifier_type", descriptor.read_u8()?)?;
        fsutils::append_u32(&entry, "specifier_data", descriptor.read_be_u24()?)?;
        fsutils::append_u16(&entry, "model", descriptor.read_be_u16()?)?;
        fsutils::append_u16(&entry, "version", descriptor.read_be_u16()?)?;
        let sub_descriptor_count = descriptor.read_u8()?;
        fsutils::append_u8(&entry, "sub_descriptor_count", sub_descriptor_count)?;
        for sub_index in 1..=sub_descriptor_count {
            let sub_entry =
                fsutils::ensure_dir(&entry, &format!("sub_descriptor_{:02}", sub_index))?;
            fsutils::append_u8(&sub_entry, "sub_descriptor_type", descriptor.read_u8()?)?;
            let sub_length = descriptor.read_u8()? as usize;
            if sub_length > 0 {
                fsutils::append_binary(
                    &sub_entry,
                    "additional_information",
                    descriptor.read(sub_length)?,
                )?;
            }
        }
    }
    Ok(())
}
