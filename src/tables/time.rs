//! TDT/TOT parsing and the MJD + packed-BCD date primitives shared by the time-aware tables.

use super::{commit, Disposition, TableParse, TID_TDT, TID_TOT};
use crate::psi::{self, Section};
use crate::{fsutils, Result, TsDemuxer};

/// Converts one packed-BCD byte (two decimal digits) to binary.
pub(crate) fn bcd_to_dec(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0f)
}

/// Splits a Modified Julian Date into calendar year, month and day.
pub(crate) fn mjd_to_ymd(mjd: u16) -> (u32, u32, u32) {
    let mjd = i64::from(mjd);
    let y1 = ((mjd as f64 - 15078.2) / 365.25) as i64;
    let m1 = ((mjd as f64 - 14956.1 - (y1 as f64 * 365.25) as i64 as f64) / 30.6001) as i64;
    let day = mjd - 14956 - (y1 as f64 * 365.25) as i64 - (m1 as f64 * 30.6001) as i64;
    let k = if m1 == 14 || m1 == 15 { 1 } else { 0 };
    let year = y1 + k + 1900;
    let month = m1 - 1 - k * 12;
    (year as u32, month as u32, day as u32)
}

/// Renders a five-byte MJD + BCD timestamp as an ISO-8601 string.
pub(crate) fn decode_mjd_time(bytes: &[u8; 5]) -> String {
    let mjd = u16::from_be_bytes([bytes[0], bytes[1]]);
    let (year, month, day) = mjd_to_ymd(mjd);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        year,
        month,
        day,
        bcd_to_dec(bytes[2]),
        bcd_to_dec(bytes[3]),
        bcd_to_dec(bytes[4])
    )
}

/// Renders a three-byte BCD duration as `HH:MM:SS`.
pub(crate) fn decode_bcd_hms(bytes: &[u8; 3]) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        bcd_to_dec(bytes[0]),
        bcd_to_dec(bytes[1]),
        bcd_to_dec(bytes[2])
    )
}

/// Renders a two-byte BCD offset as `HH:MM`.
pub(crate) fn decode_bcd_hm(bytes: &[u8; 2]) -> String {
    format!("{:02}:{:02}", bcd_to_dec(bytes[0]), bcd_to_dec(bytes[1]))
}

/// Parser for the time/date tables (TDT 0x70, TOT 0x73).
///
/// Neither table carries a version number, so each arrival rebuilds and republishes `V00`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeParser;

impl TableParse for TimeParser {
    fn accepts(&self, table_id: u8) -> bool {
        matches!(table_id, TID_TDT | TID_TOT)
    }

    fn parse(&self, demuxer: &TsDemuxer, section: Section) -> Result<()> {
        let mut reader = section.reader();
        let utc_time = *reader.read_array_ref::<5>()?;

        let vdir = fsutils::create_version_dir(0);
        psi::append_header_leaves(&vdir, &section, "table_id_extension")?;
        fsutils::append_string(&vdir, "utc_time", &decode_mjd_time(&utc_time))?;

        let name = if section.table_id() == TID_TDT {
            "TDT"
        } else {
            "TOT"
        };
        if section.table_id() == TID_TOT {
            let loop_length = (reader.read_be_u16()? & 0x0fff) as usize;
            let mut loop_reader = reader.new_sub_reader(loop_length)?;
            let descriptors = fsutils::ensure_dir(&vdir, "Descriptors")?;
            demuxer
                .descriptors()
                .decode_loop(&mut loop_reader, &descriptors)?;
        }

        let table_root = fsutils::ensure_dir(&demuxer.root(), name)?;
        let disposition = match demuxer.tables().lookup_dentry(section.key()) {
            Some(old) => Disposition::Supersede(old),
            None => Disposition::Fresh,
        };
        commit(demuxer, &table_root, vdir, &section, disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mjd_reference_date() {
        /* 1982-09-06, the worked conversion example for this encoding */
        assert_eq!(mjd_to_ymd(45218), (1982, 9, 6));
    }

    #[test]
    fn mjd_handles_year_boundaries() {
        assert_eq!(mjd_to_ymd(51544), (2000, 1, 1));
        assert_eq!(mjd_to_ymd(60310), (2024, 1, 1));
        assert_eq!(mjd_to_ymd(60309), (2023, 12, 31));
    }

    #[test]
    fn bcd_timestamp_renders_iso_8601() {
        /* MJD 45218 at 12:45:00 */
        let bytes = [0xb0, 0xa2, 0x12, 0x45, 0x00];
        assert_eq!(decode_mjd_time(&bytes), "1982-09-06T12:45:00");
    }

    #[test]
    fn bcd_duration_renders_colon_separated() {
        assert_eq!(decode_bcd_hms(&[0x01, 0x30, 0x00]), "01:30:00");
        assert_eq!(decode_bcd_hm(&[0x09, 0x30]), "09:30");
    }
}
