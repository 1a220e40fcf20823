//! Minimal DICOM Part 10 reader for produced DICOM-SEG files.
//!
//! Walks the data set up to the pixel data, collecting the series
//! descriptor attributes and counting the items of the Segment Sequence.
//! Explicit and implicit VR little endian only; dcmqi writes the former.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use thiserror::Error;

use super::nifti::read_full;

/// Group and element number of a data element.
pub type Tag = (u16, u16);

pub const MODALITY: Tag = (0x0008, 0x0060);
pub const SEGMENT_SEQUENCE: Tag = (0x0062, 0x0002);
pub const SEGMENT_NUMBER: Tag = (0x0062, 0x0004);
pub const PIXEL_DATA: Tag = (0x7FE0, 0x0010);
pub const FILE_META_GROUP_LENGTH: Tag = (0x0002, 0x0000);
pub const MEDIA_STORAGE_SOP_CLASS_UID: Tag = (0x0002, 0x0002);
pub const TRANSFER_SYNTAX_UID: Tag = (0x0002, 0x0010);

pub const ITEM: Tag = (0xFFFE, 0xE000);
pub const ITEM_DELIMITER: Tag = (0xFFFE, 0xE00D);
pub const SEQUENCE_DELIMITER: Tag = (0xFFFE, 0xE0DD);
pub const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;

pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
pub const SEGMENTATION_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.66.4";

/// Series descriptor attributes a SEG carries, by keyword.
pub const DESCRIPTOR_ATTRIBUTES: &[(&str, Tag, [u8; 2])] = &[
    ("SeriesDescription", (0x0008, 0x103E), *b"LO"),
    ("ClinicalTrialTimePointID", (0x0012, 0x0050), *b"LO"),
    ("ClinicalTrialSeriesID", (0x0012, 0x0071), *b"LO"),
    ("BodyPartExamined", (0x0018, 0x0015), *b"CS"),
    ("SeriesNumber", (0x0020, 0x0011), *b"IS"),
    ("InstanceNumber", (0x0020, 0x0013), *b"IS"),
    ("ContentCreatorName", (0x0070, 0x0084), *b"PN"),
];

const PREAMBLE_LEN: usize = 128;

/// VRs with a reserved field and a 32-bit length in explicit VR encoding.
const LONG_VRS: [&[u8; 2]; 13] = [
    b"OB", b"OD", b"OF", b"OL", b"OV", b"OW", b"SQ", b"SV", b"UC", b"UN", b"UR", b"UT", b"UV",
];

const MAX_TEXT_LEN: u32 = 64 * 1024;
const MAX_META_LEN: u32 = 64 * 1024;
const MAX_DEPTH: usize = 16;

/// Errors from reading a DICOM file.
#[derive(Debug, Error)]
pub enum DicomError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Not a DICOM file (no DICM marker)")]
    NotDicom,

    #[error("Malformed DICOM: {0}")]
    Malformed(String),

    #[error("Unsupported transfer syntax {0}")]
    UnsupportedTransferSyntax(String),
}

/// Whether a VR uses the long explicit-VR header.
pub fn has_long_length(vr: &[u8; 2]) -> bool {
    LONG_VRS.contains(&vr)
}

/// What the gate needs to know about a DICOM-SEG.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegSummary {
    pub modality: Option<String>,
    /// Descriptor attributes present in the file, by keyword.
    pub descriptor: BTreeMap<String, String>,
    /// Items in the Segment Sequence.
    pub segment_count: u32,
}

impl SegSummary {
    pub fn read(path: &Path) -> Result<Self, DicomError> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut preamble = [0u8; PREAMBLE_LEN + 4];
        match reader.read_exact(&mut preamble) {
            Ok(()) if &preamble[PREAMBLE_LEN..] == b"DICM" => {}
            Ok(()) => return Err(DicomError::NotDicom),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(DicomError::NotDicom),
            Err(e) => return Err(e.into()),
        }

        let mut parser = Parser::new(reader, true);
        let transfer_syntax = parser.read_file_meta()?;
        parser.explicit = match transfer_syntax.as_str() {
            EXPLICIT_VR_LITTLE_ENDIAN => true,
            IMPLICIT_VR_LITTLE_ENDIAN => false,
            _ => return Err(DicomError::UnsupportedTransferSyntax(transfer_syntax)),
        };
        parser.read_summary()
    }
}

struct Header {
    tag: Tag,
    vr: Option<[u8; 2]>,
    length: u32,
}

struct Parser<R> {
    reader: R,
    explicit: bool,
    position: u64,
}

impl<R: Read> Parser<R> {
    fn new(reader: R, explicit: bool) -> Self {
        Self {
            reader,
            explicit,
            position: 0,
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<(), DicomError> {
        self.reader.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                DicomError::Malformed("truncated data set".to_string())
            } else {
                DicomError::Io(e)
            }
        })?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16, DicomError> {
        let mut raw = [0u8; 2];
        self.fill(&mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    fn read_u32(&mut self) -> Result<u32, DicomError> {
        let mut raw = [0u8; 4];
        self.fill(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Next tag, or `None` at a clean end of input.
    fn read_tag(&mut self) -> Result<Option<Tag>, DicomError> {
        let mut raw = [0u8; 4];
        match read_full(&mut self.reader, &mut raw)? {
            0 => Ok(None),
            4 => {
                self.position += 4;
                Ok(Some((
                    u16::from_le_bytes([raw[0], raw[1]]),
                    u16::from_le_bytes([raw[2], raw[3]]),
                )))
            }
            _ => Err(DicomError::Malformed("truncated element tag".to_string())),
        }
    }

    fn read_header(&mut self) -> Result<Option<Header>, DicomError> {
        let Some(tag) = self.read_tag()? else {
            return Ok(None);
        };

        // Items and delimiters never carry a VR
        if tag.0 == 0xFFFE || !self.explicit {
            let length = self.read_u32()?;
            return Ok(Some(Header {
                tag,
                vr: None,
                length,
            }));
        }

        let mut vr = [0u8; 2];
        self.fill(&mut vr)?;
        let length = if has_long_length(&vr) {
            self.read_u16()?;
            self.read_u32()?
        } else {
            self.read_u16()? as u32
        };
        Ok(Some(Header {
            tag,
            vr: Some(vr),
            length,
        }))
    }

    fn skip(&mut self, length: u32) -> Result<(), DicomError> {
        let copied = io::copy(&mut (&mut self.reader).take(length as u64), &mut io::sink())?;
        if copied < length as u64 {
            return Err(DicomError::Malformed("truncated element value".to_string()));
        }
        self.position += copied;
        Ok(())
    }

    fn read_text(&mut self, length: u32) -> Result<String, DicomError> {
        if length > MAX_TEXT_LEN {
            return Err(DicomError::Malformed(format!(
                "text value of {} bytes",
                length
            )));
        }
        let mut raw = vec![0u8; length as usize];
        self.fill(&mut raw)?;
        Ok(String::from_utf8_lossy(&raw)
            .trim_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_string())
    }

    fn is_sequence(&self, header: &Header) -> bool {
        header.vr == Some(*b"SQ")
            || header.length == UNDEFINED_LENGTH
            || (header.vr.is_none() && header.tag == SEGMENT_SEQUENCE)
    }

    /// Reads the file meta group and returns the transfer syntax UID.
    fn read_file_meta(&mut self) -> Result<String, DicomError> {
        let header = self
            .read_header()?
            .ok_or_else(|| DicomError::Malformed("missing file meta information".to_string()))?;
        if header.tag != FILE_META_GROUP_LENGTH || header.length != 4 {
            return Err(DicomError::Malformed(
                "file meta information has no group length".to_string(),
            ));
        }
        let group_length = self.read_u32()?;
        if group_length > MAX_META_LEN {
            return Err(DicomError::Malformed(format!(
                "file meta group of {} bytes",
                group_length
            )));
        }

        let mut meta = vec![0u8; group_length as usize];
        self.fill(&mut meta)?;

        let mut meta_parser = Parser::new(meta.as_slice(), true);
        while let Some(header) = meta_parser.read_header()? {
            if header.tag == TRANSFER_SYNTAX_UID {
                return meta_parser.read_text(header.length);
            }
            meta_parser.skip(header.length)?;
        }
        Err(DicomError::Malformed(
            "file meta information has no transfer syntax".to_string(),
        ))
    }

    fn read_summary(&mut self) -> Result<SegSummary, DicomError> {
        let mut summary = SegSummary::default();

        while let Some(header) = self.read_header()? {
            if header.tag.0 >= PIXEL_DATA.0 {
                break;
            }

            if header.tag == SEGMENT_SEQUENCE {
                summary.segment_count = self.read_nested(&header, 1)?;
            } else if self.is_sequence(&header) {
                self.read_nested(&header, 1)?;
            } else if header.tag == MODALITY {
                summary.modality = Some(self.read_text(header.length)?);
            } else if let Some((keyword, ..)) = DESCRIPTOR_ATTRIBUTES
                .iter()
                .find(|(_, tag, _)| *tag == header.tag)
            {
                let value = self.read_text(header.length)?;
                summary.descriptor.insert(keyword.to_string(), value);
            } else {
                self.skip(header.length)?;
            }
        }

        Ok(summary)
    }

    /// Reads a sequence value and returns its item count.
    fn read_nested(&mut self, header: &Header, depth: usize) -> Result<u32, DicomError> {
        // Undefined-length UN content is always implicit VR
        let explicit = self.explicit;
        if header.vr == Some(*b"UN") {
            self.explicit = false;
        }
        let items = self.read_sequence(header.length, depth);
        self.explicit = explicit;
        items
    }

    fn read_sequence(&mut self, length: u32, depth: usize) -> Result<u32, DicomError> {
        if depth > MAX_DEPTH {
            return Err(DicomError::Malformed("sequences nested too deeply".to_string()));
        }

        let end = (length != UNDEFINED_LENGTH).then(|| self.position + length as u64);
        let mut items = 0;

        loop {
            if end.is_some_and(|end| self.position >= end) {
                break;
            }
            let tag = self
                .read_tag()?
                .ok_or_else(|| DicomError::Malformed("unterminated sequence".to_string()))?;
            let item_length = self.read_u32()?;

            match tag {
                SEQUENCE_DELIMITER => break,
                ITEM => {
                    items += 1;
                    if item_length == UNDEFINED_LENGTH {
                        self.read_item(depth)?;
                    } else {
                        self.skip(item_length)?;
                    }
                }
                (group, element) => {
                    return Err(DicomError::Malformed(format!(
                        "unexpected ({:04X},{:04X}) in sequence",
                        group, element
                    )))
                }
            }
        }

        if let Some(end) = end {
            if self.position != end {
                return Err(DicomError::Malformed(
                    "sequence overruns its length".to_string(),
                ));
            }
        }
        Ok(items)
    }

    /// Skips the elements of an undefined-length item.
    fn read_item(&mut self, depth: usize) -> Result<(), DicomError> {
        loop {
            let header = self
                .read_header()?
                .ok_or_else(|| DicomError::Malformed("unterminated item".to_string()))?;
            if header.tag == ITEM_DELIMITER {
                return Ok(());
            }
            if self.is_sequence(&header) {
                self.read_nested(&header, depth + 1)?;
            } else {
                self.skip(header.length)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::{write_seg, write_seg_with};

    fn push_tag(out: &mut Vec<u8>, tag: Tag, length: u32) {
        out.extend_from_slice(&tag.0.to_le_bytes());
        out.extend_from_slice(&tag.1.to_le_bytes());
        out.extend_from_slice(&length.to_le_bytes());
    }

    /// Part 10 file whose data set is `dataset`, encoded in `transfer_syntax`.
    fn part10(transfer_syntax: &str, dataset: &[u8]) -> Vec<u8> {
        let mut uid = transfer_syntax.as_bytes().to_vec();
        if uid.len() % 2 == 1 {
            uid.push(0);
        }
        let mut meta = Vec::new();
        meta.extend_from_slice(&TRANSFER_SYNTAX_UID.0.to_le_bytes());
        meta.extend_from_slice(&TRANSFER_SYNTAX_UID.1.to_le_bytes());
        meta.extend_from_slice(b"UI");
        meta.extend_from_slice(&(uid.len() as u16).to_le_bytes());
        meta.extend_from_slice(&uid);

        let mut bytes = vec![0u8; PREAMBLE_LEN];
        bytes.extend_from_slice(b"DICM");
        bytes.extend_from_slice(&[0x02, 0x00, 0x00, 0x00]);
        bytes.extend_from_slice(b"UL");
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&(meta.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&meta);
        bytes.extend_from_slice(dataset);
        bytes
    }

    #[test]
    fn test_reads_written_seg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.dcm");
        write_seg(&path, 7).unwrap();

        let summary = SegSummary::read(&path).unwrap();
        assert_eq!(summary.modality.as_deref(), Some("SEG"));
        assert_eq!(summary.segment_count, 7);
        assert_eq!(
            summary.descriptor.get("ContentCreatorName").map(String::as_str),
            Some("SpineAISystem")
        );
        assert_eq!(
            summary.descriptor.get("SeriesNumber").map(String::as_str),
            Some("1001")
        );
    }

    #[test]
    fn test_missing_attributes_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.dcm");
        let fields = BTreeMap::from([("SeriesDescription".to_string(), "Spine".to_string())]);
        write_seg_with(&path, &fields, 0).unwrap();

        let summary = SegSummary::read(&path).unwrap();
        assert_eq!(summary.segment_count, 0);
        assert_eq!(summary.descriptor.len(), 1);
        assert!(!summary.descriptor.contains_key("BodyPartExamined"));
    }

    #[test]
    fn test_implicit_vr_nested_sequences() {
        let mut dataset = Vec::new();
        push_tag(&mut dataset, (0x0018, 0x0015), 6);
        dataset.extend_from_slice(b"SPINE ");

        // Segment Sequence of undefined length; the second item holds a nested sequence
        push_tag(&mut dataset, SEGMENT_SEQUENCE, UNDEFINED_LENGTH);
        push_tag(&mut dataset, ITEM, 10);
        push_tag(&mut dataset, SEGMENT_NUMBER, 2);
        dataset.extend_from_slice(&1u16.to_le_bytes());
        push_tag(&mut dataset, ITEM, UNDEFINED_LENGTH);
        push_tag(&mut dataset, (0x0062, 0x0003), UNDEFINED_LENGTH);
        push_tag(&mut dataset, ITEM, 0);
        push_tag(&mut dataset, SEQUENCE_DELIMITER, 0);
        push_tag(&mut dataset, ITEM_DELIMITER, 0);
        push_tag(&mut dataset, SEQUENCE_DELIMITER, 0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("implicit.dcm");
        std::fs::write(&path, part10(IMPLICIT_VR_LITTLE_ENDIAN, &dataset)).unwrap();

        let summary = SegSummary::read(&path).unwrap();
        assert_eq!(summary.segment_count, 2);
        assert_eq!(
            summary.descriptor.get("BodyPartExamined").map(String::as_str),
            Some("SPINE")
        );
        assert!(summary.modality.is_none());
    }

    #[test]
    fn test_truncated_sequence() {
        let mut dataset = Vec::new();
        push_tag(&mut dataset, SEGMENT_SEQUENCE, UNDEFINED_LENGTH);
        push_tag(&mut dataset, ITEM, 64);
        dataset.extend_from_slice(&[0u8; 8]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.dcm");
        std::fs::write(&path, part10(IMPLICIT_VR_LITTLE_ENDIAN, &dataset)).unwrap();

        assert!(matches!(
            SegSummary::read(&path),
            Err(DicomError::Malformed(_))
        ));
    }

    #[test]
    fn test_unsupported_transfer_syntax() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deflated.dcm");
        std::fs::write(&path, part10("1.2.840.10008.1.2.1.99", &[])).unwrap();

        assert!(matches!(
            SegSummary::read(&path),
            Err(DicomError::UnsupportedTransferSyntax(ts)) if ts == "1.2.840.10008.1.2.1.99"
        ));
    }

    #[test]
    fn test_not_dicom() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, b"not dicom").unwrap();
        assert!(matches!(SegSummary::read(&path), Err(DicomError::NotDicom)));
    }
}
