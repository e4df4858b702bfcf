//! The `hdfm` file header (spec.md §4.3 "File layout", §6.2).

use super::ItlError;

const MAGIC: &[u8; 4] = b"hdfm";
/// Bytes before the length-prefixed app-version string: magic(4) +
/// header_len(4) + total_len(4) + reserved(4).
const FIXED_PREFIX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItlHeader {
    pub reserved: [u8; 4],
    pub app_version: String,
    /// Whatever bytes remain between the end of the version string and
    /// `header_len`; preserved verbatim on re-emit (spec.md §6.2: "`hdfm`
    /// header remainder ... must be preserved verbatim").
    pub remainder: Vec<u8>,
}

impl ItlHeader {
    /// Parses the header, returning the header and the number of bytes it
    /// occupies (`header_len`, i.e. where the encrypted body begins).
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize), ItlError> {
        if bytes.len() < FIXED_PREFIX_LEN {
            return Err(ItlError::Malformed("file shorter than hdfm header".into()));
        }
        if &bytes[0..4] != MAGIC {
            return Err(ItlError::Malformed("missing hdfm magic".into()));
        }
        let header_len = u32::from_be_bytes(bytes[4..8].try_into().unwrap()) as usize;
        if header_len < FIXED_PREFIX_LEN || header_len > bytes.len() {
            return Err(ItlError::Malformed("hdfm header_len out of range".into()));
        }
        let reserved: [u8; 4] = bytes[12..16].try_into().unwrap();

        let version_len_end = FIXED_PREFIX_LEN + 4;
        if version_len_end > header_len {
            return Err(ItlError::Malformed("hdfm header too short for version length".into()));
        }
        let version_len = u32::from_be_bytes(bytes[FIXED_PREFIX_LEN..version_len_end].try_into().unwrap()) as usize;
        let version_end = version_len_end + version_len;
        if version_end > header_len {
            return Err(ItlError::Malformed("hdfm app-version string exceeds header_len".into()));
        }
        let app_version = String::from_utf8(bytes[version_len_end..version_end].to_vec())
            .map_err(|_| ItlError::Malformed("hdfm app-version is not valid UTF-8".into()))?;

        let remainder = bytes[version_end..header_len].to_vec();

        Ok((
            ItlHeader {
                reserved,
                app_version,
                remainder,
            },
            header_len,
        ))
    }

    /// Current on-disk size of this header (fixed prefix + version string
    /// length prefix + version bytes + remainder).
    pub fn encoded_len(&self) -> usize {
        FIXED_PREFIX_LEN + 4 + self.app_version.len() + self.remainder.len()
    }

    /// Serialises the header, writing `total_file_len` into the
    /// total-length field (spec.md §6.2: "`hdfm` total file length field"
    /// is one of the bytes the codec may rewrite).
    pub fn emit(&self, total_file_len: u32) -> Vec<u8> {
        let header_len = self.encoded_len() as u32;
        let mut out = Vec::with_capacity(header_len as usize);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&header_len.to_be_bytes());
        out.extend_from_slice(&total_file_len.to_be_bytes());
        out.extend_from_slice(&self.reserved);
        out.extend_from_slice(&(self.app_version.len() as u32).to_be_bytes());
        out.extend_from_slice(self.app_version.as_bytes());
        out.extend_from_slice(&self.remainder);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(version: &str, remainder: &[u8]) -> Vec<u8> {
        let header = ItlHeader {
            reserved: [0; 4],
            app_version: version.to_string(),
            remainder: remainder.to_vec(),
        };
        header.emit(0)
    }

    #[test]
    fn parses_own_emitted_header() {
        let bytes = fixture("12.9.5.5", &[1, 2, 3, 4]);
        let (header, header_len) = ItlHeader::parse(&bytes).unwrap();
        assert_eq!(header.app_version, "12.9.5.5");
        assert_eq!(header.remainder, vec![1, 2, 3, 4]);
        assert_eq!(header_len, bytes.len());
    }

    #[test]
    fn rejects_missing_magic() {
        let mut bytes = fixture("1.0", &[]);
        bytes[0] = b'x';
        assert!(ItlHeader::parse(&bytes).is_err());
    }

    #[test]
    fn rejects_header_len_past_file_end() {
        let mut bytes = fixture("1.0", &[]);
        bytes[4..8].copy_from_slice(&9999u32.to_be_bytes());
        assert!(ItlHeader::parse(&bytes).is_err());
    }
}
