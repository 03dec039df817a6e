use std::{
    fs::{self, File},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use super::error::{CatalogErr, ShardReadErr};

const MAGIC: &[u8; 4] = b"ORSH";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 16;

/// Writes `rows` as a single-column text shard.
///
/// The file is written next to `path` with a `.tmp` suffix and renamed into
/// place once synced, so a reader never sees a half-written shard.
///
/// # Arguments
/// * `path` - Destination file.
/// * `rows` - Text rows, in order.
///
/// # Returns
/// The number of rows written.
pub fn pack_shard<P, S>(path: P, rows: &[S]) -> io::Result<u64>
where
    P: AsRef<Path>,
    S: AsRef<str>,
{
    let path = path.as_ref();
    let tmp = tmp_path(path);

    let mut out = BufWriter::new(File::create(&tmp)?);
    out.write_all(MAGIC)?;
    out.write_all(&VERSION.to_le_bytes())?;
    out.write_all(&(rows.len() as u64).to_le_bytes())?;

    let mut offset = 0u64;
    out.write_all(&offset.to_le_bytes())?;
    for row in rows {
        offset += row.as_ref().len() as u64;
        out.write_all(&offset.to_le_bytes())?;
    }
    for row in rows {
        out.write_all(row.as_ref().as_bytes())?;
    }

    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(rows.len() as u64)
}

/// Reads only the header of a shard and returns its declared row count.
pub fn read_declared_rows(path: &Path) -> Result<u64, CatalogErr> {
    let io_err = |source| CatalogErr::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut header = [0u8; HEADER_LEN];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut header))
        .map_err(io_err)?;

    parse_header(path, &header)
}

fn parse_header(path: &Path, header: &[u8]) -> Result<u64, CatalogErr> {
    let malformed = |reason: String| CatalogErr::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    if header.len() < HEADER_LEN {
        return Err(malformed(format!("{} byte file has no header", header.len())));
    }
    if &header[..4] != MAGIC {
        return Err(malformed("bad magic".into()));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != VERSION {
        return Err(malformed(format!("unsupported version {version}")));
    }

    Ok(read_u64(&header[8..16]))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// A fully loaded shard.
#[derive(Debug)]
pub struct ShardData {
    offsets: Vec<usize>,
    text: String,
}

impl ShardData {
    /// Loads a shard and checks it against its catalog entry.
    ///
    /// # Arguments
    /// * `path` - Shard file.
    /// * `shard` - Catalog index, for error reporting.
    /// * `declared` - Row count the catalog promises.
    ///
    /// # Errors
    /// `ShardReadErr::Missing` when the file is gone, `CatalogErr::Malformed` on
    /// a bad layout and `CatalogErr::RowCountMismatch` when the counts differ.
    pub fn open(path: &Path, shard: usize, declared: u64) -> Result<Self, ShardReadErr> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ShardReadErr::Missing {
                    shard,
                    path: path.to_path_buf(),
                });
            }
            Err(source) => {
                return Err(CatalogErr::Io {
                    path: path.to_path_buf(),
                    source,
                }
                .into());
            }
        };

        let malformed = |reason: String| CatalogErr::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        let rows = parse_header(path, &bytes)?;
        let body = &bytes[HEADER_LEN..];
        let offsets_len = (rows as usize)
            .checked_add(1)
            .and_then(|n| n.checked_mul(8))
            .filter(|&n| n <= body.len())
            .ok_or_else(|| malformed(format!("truncated offsets for {rows} rows")))?;

        let (raw_offsets, payload) = body.split_at(offsets_len);
        let offsets: Vec<usize> = raw_offsets
            .chunks_exact(8)
            .map(|c| read_u64(c) as usize)
            .collect();

        let text = String::from_utf8(payload.to_vec())
            .map_err(|e| malformed(format!("payload is not utf-8: {e}")))?;

        let ordered = offsets.first() == Some(&0)
            && offsets.windows(2).all(|w| w[0] <= w[1])
            && offsets.last() == Some(&text.len())
            && offsets.iter().all(|&o| text.is_char_boundary(o));
        if !ordered {
            return Err(malformed("offsets don't delimit the payload".into()).into());
        }

        if rows != declared {
            return Err(CatalogErr::RowCountMismatch {
                shard,
                declared,
                actual: rows,
            }
            .into());
        }

        Ok(Self { offsets, text })
    }

    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns row `i`, `i` must be below `len()`.
    pub fn row(&self, i: usize) -> &str {
        &self.text[self.offsets[i]..self.offsets[i + 1]]
    }
}
