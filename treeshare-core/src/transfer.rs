//! File transfer session framing: `[u16 BE name length][UTF-8 name][u64 BE size][size bytes]`.

use std::path::{Path, PathBuf};

/// Copy buffer size on both ends of a transfer.
pub const TRANSFER_CHUNK_SIZE: usize = 2048;

const NAME_LEN_SIZE: usize = 2;
const FILE_SIZE_SIZE: usize = 8;

/// Header sent by the server before the file bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub size: u64,
}

impl FileHeader {
    /// `name` must be a single path component; it becomes a file name on the receiving side.
    pub fn new(name: impl Into<String>, size: u64) -> Result<Self, HeaderError> {
        let name = name.into();
        check_component(&name)?;
        if name.len() > u16::MAX as usize {
            return Err(HeaderError::NameTooLong(name.len()));
        }
        Ok(Self { name, size })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NAME_LEN_SIZE + self.name.len() + FILE_SIZE_SIZE);
        out.extend_from_slice(&(self.name.len() as u16).to_be_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&self.size.to_be_bytes());
        out
    }

    /// Decode a header from the front of `bytes`. Returns the header and bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(FileHeader, usize), HeaderError> {
        if bytes.len() < NAME_LEN_SIZE {
            return Err(HeaderError::NeedMore);
        }
        let name_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let total = NAME_LEN_SIZE + name_len + FILE_SIZE_SIZE;
        if bytes.len() < total {
            return Err(HeaderError::NeedMore);
        }
        let name = std::str::from_utf8(&bytes[NAME_LEN_SIZE..NAME_LEN_SIZE + name_len])
            .map_err(|_| HeaderError::NameNotUtf8)?;
        let mut size = [0u8; FILE_SIZE_SIZE];
        size.copy_from_slice(&bytes[NAME_LEN_SIZE + name_len..total]);
        let header = FileHeader::new(name, u64::from_be_bytes(size))?;
        Ok((header, total))
    }

    /// `<download_dir>/<server_host>/<name>`.
    pub fn destination(&self, download_dir: &Path, server_host: &str) -> Result<PathBuf, HeaderError> {
        check_component(server_host)?;
        Ok(download_dir.join(server_host).join(&self.name))
    }
}

fn check_component(s: &str) -> Result<(), HeaderError> {
    if s.is_empty()
        || s == "."
        || s == ".."
        || s.contains(|c: char| c == '/' || c == '\\' || c == '\0')
    {
        return Err(HeaderError::UnsafeName(s.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("need more bytes")]
    NeedMore,
    #[error("file name is not UTF-8")]
    NameNotUtf8,
    #[error("file name of {0} bytes does not fit the header")]
    NameTooLong(usize),
    #[error("refusing unsafe file name {0:?}")]
    UnsafeName(String),
}
