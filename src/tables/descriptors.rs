//! Table-driven descriptor decoding.
//!
//! Each 8-bit descriptor tag maps to a small decoder that appends leaves under the
//! descriptor's directory. Unknown tags fall back to a raw data leaf, so adding a decoder is
//! purely additive and the table parsers stay ignorant of the descriptor list.

use super::time::{decode_bcd_hm, decode_mjd_time};
use crate::dentry::Dentry;
use crate::{fsutils, Result, SliceReader};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// One raw descriptor as it appears in a PSI descriptor loop.
#[derive(Debug)]
pub struct Descriptor {
    /// Descriptor tag.
    pub tag: u8,
    /// Payload bytes after the tag/length pair.
    pub data: SmallVec<[u8; 8]>,
}

impl Descriptor {
    /// Reads one `{tag, length, data}` descriptor from the reader.
    pub fn new_from_reader(reader: &mut SliceReader) -> Result<Self> {
        let tag_len = reader.read_array_ref::<2>()?;
        let mut data = SmallVec::<[u8; 8]>::new();
        data.extend_from_slice(reader.read(tag_len[1] as usize)?);
        Ok(Self {
            tag: tag_len[0],
            data,
        })
    }

    /// Reader positioned at the start of the payload.
    pub fn reader(&self) -> SliceReader<'_> {
        SliceReader::new(&self.data)
    }
}

/// Decoder callback appending leaves for one descriptor under its directory.
pub type DescriptorDecoder = fn(&Descriptor, &Arc<Dentry>) -> Result<()>;

/// Registry mapping descriptor tags to named decoders.
pub struct DescriptorRegistry {
    decoders: HashMap<u8, (&'static str, DescriptorDecoder)>,
}

impl Default for DescriptorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            decoders: HashMap::new(),
        };
        registry.register(0x09, "ca", decode_ca);
        registry.register(0x0a, "iso_639_language", decode_iso_639_language);
        registry.register(0x40, "network_name", decode_network_name);
        registry.register(0x41, "service_list", decode_service_list);
        registry.register(0x48, "service", decode_service);
        registry.register(0x52, "stream_identifier", decode_stream_identifier);
        registry.register(0x58, "local_time_offset", decode_local_time_offset);
        registry
    }
}

impl DescriptorRegistry {
    /// Registers a decoder for `tag`, replacing any previous registration.
    pub fn register(&mut self, tag: u8, name: &'static str, decoder: DescriptorDecoder) {
        self.decoders.insert(tag, (name, decoder));
    }

    /// Decodes a whole descriptor loop, appending one `descriptor_NN` directory per entry.
    ///
    /// Returns the raw descriptors so callers can act on tags they care about (e.g. PMT
    /// spotting an application signalling descriptor).
    pub fn decode_loop(
        &self,
        reader: &mut SliceReader,
        parent: &Arc<Dentry>,
    ) -> Result<Vec<Descriptor>> {
        let mut descriptors = Vec::new();
        while reader.remaining_len() > 0 {
            let descriptor = Descriptor::new_from_reader(reader)?;
            let dir = Dentry::new_dir(&format!("descriptor_{:02}", descriptors.len() + 1));
            fsutils::append_u8(&dir, "descriptor_tag", descriptor.tag)?;
            fsutils::append_u8(&dir, "descriptor_length", descriptor.data.len() as u8)?;
            match self.decoders.get(&descriptor.tag) {
                Some((name, decoder)) => {
                    fsutils::append_string(&dir, "name", name)?;
                    decoder(&descriptor, &dir)?;
                }
                None => {
                    fsutils::append_binary(&dir, "data", &descriptor.data)?;
                }
            }
            parent.add_child(dir)?;
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }
}

fn decode_ca(descriptor: &Descriptor, dir: &Arc<Dentry>) -> Result<()> {
    let mut reader = descriptor.reader();
    fsutils::append_u16(dir, "ca_system_id", reader.read_be_u16()?)?;
    fsutils::append_u16(dir, "ca_pid", reader.read_be_u16()? & 0x1fff)?;
    if reader.remaining_len() > 0 {
        fsutils::append_binary(dir, "private_data", reader.read_to_end()?)?;
    }
    Ok(())
}

fn decode_iso_639_language(descriptor: &Descriptor, dir: &Arc<Dentry>) -> Result<()> {
    let mut reader = descriptor.reader();
    let mut index = 0;
    while reader.remaining_len() >= 4 {
        index += 1;
        let entry = Dentry::new_dir(&format!("language_{:02}", index));
        let code = reader.read_array_ref::<3>()?;
        fsutils::append_string(&entry, "iso_639_language_code", &String::from_utf8_lossy(code))?;
        fsutils::append_u8(&entry, "audio_type", reader.read_u8()?)?;
        dir.add_child(entry)?;
    }
    Ok(())
}

fn decode_network_name(descriptor: &Descriptor, dir: &Arc<Dentry>) -> Result<()> {
    fsutils::append_string(dir, "network_name", &String::from_utf8_lossy(&descriptor.data))?;
    Ok(())
}

fn decode_service_list(descriptor: &Descriptor, dir: &Arc<Dentry>) -> Result<()> {
    let mut reader = descriptor.reader();
    while reader.remaining_len() >= 3 {
        let service_id = reader.read_be_u16()?;
        let service_type = reader.read_u8()?;
        fsutils::append_u8(dir, &format!("service_0x{:04x}", service_id), service_type)?;
    }
    Ok(())
}

fn decode_service(descriptor: &Descriptor, dir: &Arc<Dentry>) -> Result<()> {
    let mut reader = descriptor.reader();
    fsutils::append_u8(dir, "service_type", reader.read_u8()?)?;
    let provider_len = reader.read_u8()? as usize;
    let provider = reader.read(provider_len)?;
    fsutils::append_string(dir, "service_provider_name", &String::from_utf8_lossy(provider))?;
    let name_len = reader.read_u8()? as usize;
    let name = reader.read(name_len)?;
    fsutils::append_string(dir, "service_name", &String::from_utf8_lossy(name))?;
    Ok(())
}

fn decode_stream_identifier(descriptor: &Descriptor, dir: &Arc<Dentry>) -> Result<()> {
    let mut reader = descriptor.reader();
    fsutils::append_u8(dir, "component_tag", reader.read_u8()?)?;
    Ok(())
}

fn decode_local_time_offset(descriptor: &Descriptor, dir: &Arc<Dentry>) -> Result<()> {
    let mut reader = descriptor.reader();
    let mut index = 0;
    while reader.remaining_len() >= 13 {
        index += 1;
        let entry = Dentry::new_dir(&format!("region_{:02}", index));
        let country = reader.read_array_ref::<3>()?;
        fsutils::append_string(&entry, "country_code", &String::from_utf8_lossy(country))?;
        let region = reader.read_u8()?;
        fsutils::append_u8(&entry, "country_region_id", region >> 2)?;
        fsutils::append_flag(&entry, "local_time_offset_polarity", region & 0x01 != 0)?;
        fsutils::append_string(&entry, "local_time_offset", &decode_bcd_hm(reader.read_array_ref::<2>()?))?;
        fsutils::append_string(&entry, "time_of_change", &decode_mjd_time(reader.read_array_ref::<5>()?))?;
        fsutils::append_string(&entry, "next_time_offset", &decode_bcd_hm(reader.read_array_ref::<2>()?))?;
        dir.add_child(entry)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tag_decodes_named_leaves() {
        let registry = DescriptorRegistry::default();
        let parent = Dentry::new_dir("Descriptors");
        /* stream_identifier with component_tag 0x30 */
        let bytes = [0x52, 0x01, 0x30];
        let mut reader = SliceReader::new(&bytes);
        let parsed = registry.decode_loop(&mut reader, &parent).unwrap();
        assert_eq!(parsed.len(), 1);
        let dir = parent.lookup("descriptor_01").unwrap();
        assert_eq!(dir.lookup("name").unwrap().file_content(), Some(&b"stream_identifier"[..]));
        assert_eq!(dir.lookup("component_tag").unwrap().file_content(), Some(&b"48"[..]));
    }

    #[test]
    fn unknown_tag_keeps_raw_bytes() {
        let registry = DescriptorRegistry::default();
        let parent = Dentry::new_dir("Descriptors");
        let bytes = [0xf0, 0x02, 0xca, 0xfe];
        let mut reader = SliceReader::new(&bytes);
        registry.decode_loop(&mut reader, &parent).unwrap();
        let dir = parent.lookup("descriptor_01").unwrap();
        assert_eq!(dir.lookup("data").unwrap().file_content(), Some(&[0xca, 0xfe][..]));
        assert!(dir.lookup("name").is_none());
    }

    #[test]
    fn loop_indexes_descriptors_in_order() {
        let registry = DescriptorRegistry::default();
        let parent = Dentry::new_dir("Descriptors");
        let bytes = [0x52, 0x01, 0x01, 0xf0, 0x00];
        let mut reader = SliceReader::new(&bytes);
        let parsed = registry.decode_loop(&mut reader, &parent).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parent.lookup("descriptor_01").is_some());
        assert!(parent.lookup("descriptor_02").is_some());
    }

    #[test]
    fn service_descriptor_names_round_trip() {
        let registry = DescriptorRegistry::default();
        let parent = Dentry::new_dir("Descriptors");
        let mut bytes = vec![0x48, 0x00, 0x01];
        bytes.extend_from_slice(&[0x03, b'T', b'V', b'1']);
        bytes.extend_from_slice(&[0x04, b'N', b'E', b'W', b'S']);
        bytes[1] = (bytes.len() - 2) as u8;
        let mut reader = SliceReader::new(&bytes);
        registry.decode_loop(&mut reader, &parent).unwrap();
        let dir = parent.lookup("descriptor_01").unwrap();
        assert_eq!(dir.lookup("service_provider_name").unwrap().file_content(), Some(&b"TV1"[..]));
        assert_eq!(dir.lookup("service_name").unwrap().file_content(), Some(&b"NEWS"[..]));
    }
}
