//! Gzip member header inspection and normalisation.
//!
//! Compressed NIfTI files often carry the original file name and a
//! modification time in their gzip header, which the BIDS validator reports
//! as `GZIP_HEADER_*` warnings. Cleaning zeroes MTIME and drops FNAME and
//! FHCRC without touching the compressed payload.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::core::transfer_engine::{ExclusionRules, scan_directory};

const MAGIC: [u8; 2] = [0x1f, 0x8b];
const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GzHeader {
    pub method: u8,
    pub flags: u8,
    pub mtime: u32,
    pub xfl: u8,
    pub os: u8,
    pub extra: Option<Vec<u8>>,
    pub filename: Option<Vec<u8>>,
    pub comment: Option<Vec<u8>>,
    pub has_crc: bool,
}

impl GzHeader {
    pub fn needs_cleaning(&self) -> bool {
        self.mtime != 0 || self.filename.is_some()
    }

    pub fn filename_lossy(&self) -> Option<String> {
        self.filename
            .as_ref()
            .map(|f| String::from_utf8_lossy(f).into_owned())
    }

    /// Header bytes with MTIME zeroed and FNAME/FHCRC removed.
    fn cleaned_bytes(&self) -> Vec<u8> {
        let flags = self.flags & !(FNAME | FHCRC);
        let mut out = Vec::with_capacity(10);
        out.extend_from_slice(&MAGIC);
        out.push(self.method);
        out.push(flags);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(self.xfl);
        out.push(self.os);
        if let Some(extra) = &self.extra {
            out.extend_from_slice(&(extra.len() as u16).to_le_bytes());
            out.extend_from_slice(extra);
        }
        if let Some(comment) = &self.comment {
            out.extend_from_slice(comment);
            out.push(0);
        }
        out
    }
}

fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut b = [0u8; 1];
    reader.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_zero_terminated<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match read_u8(reader)? {
            0 => return Ok(out),
            b => out.push(b),
        }
    }
}

/// Parse the first member header, leaving `reader` positioned at the payload.
pub fn read_header<R: Read>(reader: &mut R) -> io::Result<GzHeader> {
    let mut fixed = [0u8; 10];
    reader.read_exact(&mut fixed)?;
    if fixed[..2] != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not a gzip file"));
    }

    let flags = fixed[3];
    let mut header = GzHeader {
        method: fixed[2],
        flags,
        mtime: u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
        xfl: fixed[8],
        os: fixed[9],
        extra: None,
        filename: None,
        comment: None,
        has_crc: flags & FHCRC != 0,
    };

    if flags & FEXTRA != 0 {
        let mut len = [0u8; 2];
        reader.read_exact(&mut len)?;
        let mut extra = vec![0u8; u16::from_le_bytes(len) as usize];
        reader.read_exact(&mut extra)?;
        header.extra = Some(extra);
    }
    if flags & FNAME != 0 {
        header.filename = Some(read_zero_terminated(reader)?);
    }
    if flags & FCOMMENT != 0 {
        header.comment = Some(read_zero_terminated(reader)?);
    }
    if header.has_crc {
        let mut crc = [0u8; 2];
        reader.read_exact(&mut crc)?;
    }
    Ok(header)
}

pub fn inspect(path: &Path) -> io::Result<GzHeader> {
    let mut reader = BufReader::new(File::open(path)?);
    read_header(&mut reader)
}

/// Rewrite `path` with a clean header. Returns whether anything changed.
pub fn clean_file(path: &Path, dry_run: bool) -> io::Result<bool> {
    let file = File::open(path)?;
    let permissions = file.metadata()?.permissions();
    let mut reader = BufReader::new(file);
    let header = read_header(&mut reader)?;

    if !header.needs_cleaning() {
        return Ok(false);
    }
    if dry_run {
        info!(
            path = %path.display(),
            mtime = header.mtime,
            filename = ?header.filename_lossy(),
            "[dry-run] would clean gzip header"
        );
        return Ok(true);
    }

    let dir = path.parent().unwrap_or(Path::new("."));
    let tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        writer.write_all(&header.cleaned_bytes())?;
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    fs::set_permissions(tmp.path(), permissions)?;
    tmp.persist(path).map_err(|e| e.error)?;

    debug!(path = %path.display(), "Gzip header cleaned");
    Ok(true)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanSummary {
    pub checked: u64,
    pub cleaned: u64,
    pub errors: u64,
}

fn gz_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let scan = scan_directory(root, &ExclusionRules::default())?;
    Ok(scan
        .files
        .into_iter()
        .filter(|f| f.path.extension().is_some_and(|e| e == "gz"))
        .map(|f| f.path)
        .collect())
}

/// Clean every `.gz` file under `root`.
pub fn clean_tree(root: &Path, dry_run: bool) -> io::Result<CleanSummary> {
    let mut summary = CleanSummary::default();
    for path in gz_files(root)? {
        summary.checked += 1;
        match clean_file(&path, dry_run) {
            Ok(true) => summary.cleaned += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not clean gzip header");
                summary.errors += 1;
            }
        }
    }
    info!(
        checked = summary.checked,
        cleaned = summary.cleaned,
        errors = summary.errors,
        "Gzip header pass finished"
    );
    Ok(summary)
}

/// Relative paths of `.gz` files whose header would be cleaned.
pub fn find_dirty(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirty = Vec::new();
    for path in gz_files(root)? {
        match inspect(&path) {
            Ok(h) if h.needs_cleaning() => {
                dirty.push(path.strip_prefix(root).unwrap_or(&path).to_path_buf())
            }
            Ok(_) => {}
            Err(e) => debug!(path = %path.display(), error = %e, "Unreadable gzip header"),
        }
    }
    Ok(dirty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Header with FNAME and a non-zero MTIME, followed by a fake payload.
    fn dirty_gzip(name: &str) -> Vec<u8> {
        let mut bytes = vec![0x1f, 0x8b, 8, FNAME];
        bytes.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        bytes.extend_from_slice(&[0, 3]);
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(b"PAYLOAD");
        bytes
    }

    #[test]
    fn parses_name_and_mtime() {
        let bytes = dirty_gzip("sub-01_T1w.nii");
        let header = read_header(&mut bytes.as_slice()).unwrap();
        assert_eq!(header.mtime, 1_700_000_000);
        assert_eq!(header.filename_lossy().as_deref(), Some("sub-01_T1w.nii"));
        assert!(header.needs_cleaning());
    }

    #[test]
    fn rejects_non_gzip() {
        let err = read_header(&mut b"plain text file".as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn cleaning_keeps_payload_and_comment() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("bold.nii.gz");
        let mut bytes = vec![0x1f, 0x8b, 8, FNAME | FCOMMENT | FHCRC];
        bytes.extend_from_slice(&42u32.to_le_bytes());
        bytes.extend_from_slice(&[0, 3]);
        bytes.extend_from_slice(b"bold.nii\0");
        bytes.extend_from_slice(b"scanner\0");
        bytes.extend_from_slice(&[0xAA, 0xBB]);
        bytes.extend_from_slice(b"PAYLOAD");
        fs::write(&path, &bytes).unwrap();

        assert!(clean_file(&path, false).unwrap());

        let cleaned = fs::read(&path).unwrap();
        let header = read_header(&mut cleaned.as_slice()).unwrap();
        assert_eq!(header.mtime, 0);
        assert!(header.filename.is_none());
        assert!(!header.has_crc);
        assert_eq!(header.comment.as_deref(), Some(b"scanner".as_slice()));
        assert!(cleaned.ends_with(b"PAYLOAD"));
        assert!(!clean_file(&path, false).unwrap());
    }

    #[test]
    fn dry_run_leaves_file_untouched() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("a.nii.gz");
        let bytes = dirty_gzip("a.nii");
        fs::write(&path, &bytes).unwrap();

        let summary = clean_tree(temp.path(), true).unwrap();
        assert_eq!(summary, CleanSummary { checked: 1, cleaned: 1, errors: 0 });
        assert_eq!(fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn find_dirty_lists_relative_paths() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("anat")).unwrap();
        fs::write(temp.path().join("anat/T1w.nii.gz"), dirty_gzip("T1w.nii")).unwrap();
        fs::write(temp.path().join("notes.txt.gz"), b"not gzip").unwrap();

        let dirty = find_dirty(temp.path()).unwrap();
        assert_eq!(dirty, vec![PathBuf::from("anat/T1w.nii.gz")]);
    }
}
