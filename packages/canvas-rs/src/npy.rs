// NumPy .npy container handling
//
// Only the pieces the uploader needs: parsing the header of a 2-D real or
// complex array, decoding single elements, and a streaming writer. Arrays are
// never materialised; callers seek to the elements they want.

use crate::error::{Result, UploadError};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

pub const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Largest header dict accepted; real headers are a few hundred bytes
pub const MAX_HEADER_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Element type of a supported array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dtype {
    pub complex: bool,
    /// Bytes per real component (4 or 8)
    pub width: usize,
    pub endian: Endian,
}

impl Dtype {
    pub const COMPLEX128: Dtype = Dtype {
        complex: true,
        width: 8,
        endian: Endian::Little,
    };

    pub fn parse(descr: &str) -> Result<Self> {
        let mut chars = descr.chars();
        let endian = match chars.next() {
            Some('<') => Endian::Little,
            Some('>') => Endian::Big,
            // Byte order is irrelevant for single-byte types, none of which we accept
            _ => {
                return Err(UploadError::UnsupportedFormat(format!(
                    "unsupported dtype '{}'",
                    descr
                )))
            }
        };
        let (complex, width) = match chars.as_str() {
            "c16" => (true, 8),
            "c8" => (true, 4),
            "f8" => (false, 8),
            "f4" => (false, 4),
            _ => {
                return Err(UploadError::UnsupportedFormat(format!(
                    "unsupported dtype '{}' (expected complex or float)",
                    descr
                )))
            }
        };
        Ok(Self {
            complex,
            width,
            endian,
        })
    }

    pub fn descr(&self) -> String {
        let order = match self.endian {
            Endian::Little => '<',
            Endian::Big => '>',
        };
        let kind = if self.complex { 'c' } else { 'f' };
        let size = if self.complex { self.width * 2 } else { self.width };
        format!("{}{}{}", order, kind, size)
    }

    /// Bytes per array element
    pub fn item_size(&self) -> usize {
        if self.complex {
            self.width * 2
        } else {
            self.width
        }
    }

    fn read_scalar<R: Read>(&self, r: &mut R) -> std::io::Result<f64> {
        match (self.width, self.endian) {
            (8, Endian::Little) => r.read_f64::<LittleEndian>(),
            (8, Endian::Big) => r.read_f64::<BigEndian>(),
            (4, Endian::Little) => r.read_f32::<LittleEndian>().map(f64::from),
            _ => r.read_f32::<BigEndian>().map(f64::from),
        }
    }

    fn write_scalar<W: Write>(&self, w: &mut W, value: f64) -> std::io::Result<()> {
        match (self.width, self.endian) {
            (8, Endian::Little) => w.write_f64::<LittleEndian>(value),
            (8, Endian::Big) => w.write_f64::<BigEndian>(value),
            (4, Endian::Little) => w.write_f32::<LittleEndian>(value as f32),
            _ => w.write_f32::<BigEndian>(value as f32),
        }
    }

    /// Read one element as (real, imaginary); real arrays yield 0 imaginary
    pub fn read_element<R: Read>(&self, r: &mut R) -> std::io::Result<(f64, f64)> {
        let re = self.read_scalar(r)?;
        let im = if self.complex { self.read_scalar(r)? } else { 0.0 };
        Ok((re, im))
    }

    pub fn write_element<W: Write>(&self, w: &mut W, re: f64, im: f64) -> std::io::Result<()> {
        self.write_scalar(w, re)?;
        if self.complex {
            self.write_scalar(w, im)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NpyHeader {
    pub dtype: Dtype,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
    /// Byte offset of the first element
    pub data_offset: u64,
}

impl NpyHeader {
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut magic = [0u8; 6];
        r.read_exact(&mut magic)
            .map_err(|_| UploadError::UnsupportedFormat("file too short for .npy".to_string()))?;
        if &magic != MAGIC {
            return Err(UploadError::UnsupportedFormat(
                "not a .npy file (bad magic string)".to_string(),
            ));
        }

        let major = r.read_u8()?;
        let _minor = r.read_u8()?;
        let (header_len, preamble) = match major {
            1 => (r.read_u16::<LittleEndian>()? as usize, 10),
            2 | 3 => (r.read_u32::<LittleEndian>()? as usize, 12),
            v => {
                return Err(UploadError::UnsupportedFormat(format!(
                    "unsupported .npy version {}",
                    v
                )))
            }
        };

        if header_len > MAX_HEADER_LEN {
            return Err(UploadError::UnsupportedFormat(format!(
                "header length {} exceeds the {} byte limit",
                header_len, MAX_HEADER_LEN
            )));
        }
        let mut raw = vec![0u8; header_len];
        r.read_exact(&mut raw)?;
        let text = String::from_utf8_lossy(&raw);

        let descr = dict_value(&text, "descr")
            .and_then(quoted)
            .ok_or_else(|| UploadError::UnsupportedFormat("header has no 'descr'".to_string()))?;
        let fortran_order = match dict_value(&text, "fortran_order") {
            Some(v) if v.starts_with("True") => true,
            Some(v) if v.starts_with("False") => false,
            _ => {
                return Err(UploadError::UnsupportedFormat(
                    "header has no 'fortran_order'".to_string(),
                ))
            }
        };
        let shape = dict_value(&text, "shape")
            .and_then(parse_shape)
            .ok_or_else(|| UploadError::UnsupportedFormat("header has no valid 'shape'".to_string()))?;

        Ok(Self {
            dtype: Dtype::parse(descr)?,
            fortran_order,
            shape,
            data_offset: (preamble + header_len) as u64,
        })
    }

    pub fn read_path(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        Self::read_from(&mut file)
    }

    /// Header dict literal, space padded so the data starts on a 64-byte boundary
    pub fn encode(dtype: Dtype, fortran_order: bool, shape: &[usize]) -> Vec<u8> {
        let dims = match shape {
            [single] => format!("{},", single),
            _ => shape
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        };
        let mut dict = format!(
            "{{'descr': '{}', 'fortran_order': {}, 'shape': ({}), }}",
            dtype.descr(),
            if fortran_order { "True" } else { "False" },
            dims
        );
        let unpadded = 10 + dict.len() + 1;
        let padding = (64 - unpadded % 64) % 64;
        dict.push_str(&" ".repeat(padding));
        dict.push('\n');

        let mut out = Vec::with_capacity(10 + dict.len());
        out.extend_from_slice(MAGIC);
        out.push(1);
        out.push(0);
        out.extend_from_slice(&(dict.len() as u16).to_le_bytes());
        out.extend_from_slice(dict.as_bytes());
        out
    }
}

fn dict_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let start = text
        .find(&format!("'{}'", key))
        .or_else(|| text.find(&format!("\"{}\"", key)))?;
    let rest = &text[start + key.len() + 2..];
    let colon = rest.find(':')?;
    Some(rest[colon + 1..].trim_start())
}

fn quoted(value: &str) -> Option<&str> {
    let quote = value.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let body = &value[1..];
    let end = body.find(quote)?;
    Some(&body[..end])
}

fn parse_shape(value: &str) -> Option<Vec<usize>> {
    let body = value.strip_prefix('(')?;
    let end = body.find(')')?;
    body[..end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_end_matches('L').parse::<usize>().ok())
        .collect()
}

/// Streaming writer for a 2-D array in C order
pub struct NpyWriter {
    out: BufWriter<File>,
    dtype: Dtype,
    expected: usize,
    written: usize,
}

impl NpyWriter {
    pub fn create(path: &Path, dtype: Dtype, rows: usize, cols: usize) -> Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&NpyHeader::encode(dtype, false, &[rows, cols]))?;
        Ok(Self {
            out,
            dtype,
            expected: rows * cols,
            written: 0,
        })
    }

    pub fn write(&mut self, re: f64, im: f64) -> Result<()> {
        if self.written >= self.expected {
            return Err(UploadError::InvalidParameter(format!(
                "array already holds all {} elements",
                self.expected
            )));
        }
        self.dtype.write_element(&mut self.out, re, im)?;
        self.written += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        if self.written != self.expected {
            return Err(UploadError::InvalidParameter(format!(
                "wrote {} of {} elements",
                self.written, self.expected
            )));
        }
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header_bytes(version: u8, dict: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(version);
        out.push(0);
        if version == 1 {
            out.extend_from_slice(&(dict.len() as u16).to_le_bytes());
        } else {
            out.extend_from_slice(&(dict.len() as u32).to_le_bytes());
        }
        out.extend_from_slice(dict.as_bytes());
        out
    }

    #[test]
    fn test_parse_v1_header() {
        let bytes = header_bytes(
            1,
            "{'descr': '<c16', 'fortran_order': False, 'shape': (3, 1000), }\n",
        );
        let header = NpyHeader::read_from(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(header.dtype, Dtype::COMPLEX128);
        assert!(!header.fortran_order);
        assert_eq!(header.shape, vec![3, 1000]);
        assert_eq!(header.data_offset, bytes.len() as u64);
    }

    #[test]
    fn test_parse_v2_fortran_header() {
        let bytes = header_bytes(
            2,
            "{'descr': '>f4', 'fortran_order': True, 'shape': (5, 7), }\n",
        );
        let header = NpyHeader::read_from(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(header.dtype.width, 4);
        assert_eq!(header.dtype.endian, Endian::Big);
        assert!(!header.dtype.complex);
        assert!(header.fortran_order);
        assert_eq!(header.data_offset, bytes.len() as u64);
    }

    #[test]
    fn test_oversized_header_len_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.push(2);
        bytes.push(0);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = NpyHeader::read_from(&mut Cursor::new(&bytes)).unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedFormat(_)));
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn test_bad_magic_is_unsupported() {
        let err = NpyHeader::read_from(&mut Cursor::new(b"PK\x03\x04 not numpy".to_vec()))
            .unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_unsupported_dtype() {
        let bytes = header_bytes(
            1,
            "{'descr': '<i8', 'fortran_order': False, 'shape': (2, 2), }\n",
        );
        let err = NpyHeader::read_from(&mut Cursor::new(&bytes)).unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedFormat(_)));
        assert!(Dtype::parse("|b1").is_err());
    }

    #[test]
    fn test_encoded_header_is_aligned_and_parses() {
        let encoded = NpyHeader::encode(Dtype::COMPLEX128, false, &[12, 345]);
        assert_eq!(encoded.len() % 64, 0);
        let header = NpyHeader::read_from(&mut Cursor::new(&encoded)).unwrap();
        assert_eq!(header.shape, vec![12, 345]);
        assert_eq!(header.data_offset, encoded.len() as u64);
    }

    #[test]
    fn test_element_decoding() {
        let dtype = Dtype::parse("<c8").unwrap();
        let mut buf = Vec::new();
        dtype.write_element(&mut buf, 1.5, -2.25).unwrap();
        assert_eq!(buf.len(), dtype.item_size());
        assert_eq!(dtype.read_element(&mut Cursor::new(&buf)).unwrap(), (1.5, -2.25));

        let real = Dtype::parse(">f8").unwrap();
        let mut buf = Vec::new();
        real.write_element(&mut buf, 4.0, 9.0).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(real.read_element(&mut Cursor::new(&buf)).unwrap(), (4.0, 0.0));
    }

    #[test]
    fn test_writer_enforces_element_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.npy");
        let mut writer = NpyWriter::create(&path, Dtype::COMPLEX128, 2, 2).unwrap();
        writer.write(1.0, 0.0).unwrap();
        assert!(writer.finish().is_err());

        let mut writer = NpyWriter::create(&path, Dtype::COMPLEX128, 1, 1).unwrap();
        writer.write(1.0, 0.0).unwrap();
        assert!(writer.write(2.0, 0.0).is_err());
        writer.finish().unwrap();

        let header = NpyHeader::read_path(&path).unwrap();
        assert_eq!(header.shape, vec![1, 1]);
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, header.data_offset + 16);
    }
}
