//! Snapshot archive format and integrity checking
//!
//! A snapshot archive is a gzip-compressed ustar stream. Every member is
//! listed in a `SHA256SUMS` member (`<hex digest>  <name>` per line) and
//! `meta.json` carries the snapshot metadata. Verification streams the
//! archive once, hashing each member as it goes. `meta.json` and
//! `state.bin` are mandatory and nothing may follow the gzip stream.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, BufReader, Read, Write};

use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Name of the checksum manifest member
pub const SUMS_MEMBER: &str = "SHA256SUMS";

/// Name of the metadata member
pub const META_MEMBER: &str = "meta.json";

/// Name of the state member
pub const STATE_MEMBER: &str = "state.bin";

const BLOCK: usize = 512;

/// Integrity failures found in a snapshot archive
#[derive(Error, Debug)]
pub enum VerifyError {
    /// Decompression or read failure, including a bad gzip trailer
    #[error("Archive could not be read: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed archive header: {0}")]
    Header(String),

    #[error("Archive has no {0} member")]
    MissingMember(String),

    /// A member does not hash to its manifest entry
    #[error("Checksum mismatch for {member}: expected {expected}, got {actual}")]
    Checksum {
        member: String,
        expected: String,
        actual: String,
    },

    #[error("Malformed SHA256SUMS line: {0}")]
    Manifest(String),

    #[error("Invalid meta.json: {0}")]
    Metadata(String),

    /// A member was hashed but has no manifest entry
    #[error("{0} is not listed in SHA256SUMS")]
    Unlisted(String),

    /// Bytes follow the end of the compressed stream
    #[error("{0} unexpected bytes after the compressed archive")]
    TrailingData(u64),
}

/// Summary of a successfully verified archive
#[derive(Debug, Clone, Default)]
pub struct VerifiedArchive {
    /// Member names with their SHA-256 digests, in hex
    pub members: BTreeMap<String, String>,
    /// Decoded `meta.json`
    pub metadata: serde_json::Value,
}

/// Integrity check run over a snapshot payload as it streams in
pub trait SnapshotVerifier: Send + Sync {
    /// Consume `reader` and accept or reject the payload
    fn verify(&self, reader: &mut dyn Read) -> Result<VerifiedArchive, VerifyError>;
}

/// Verifies gzip-compressed tar archives against their `SHA256SUMS` manifest
#[derive(Debug, Clone, Default)]
pub struct ArchiveVerifier {
    _private: (),
}

impl ArchiveVerifier {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotVerifier for ArchiveVerifier {
    fn verify(&self, reader: &mut dyn Read) -> Result<VerifiedArchive, VerifyError> {
        let mut decoder = GzDecoder::new(BufReader::new(reader));
        let mut digests = BTreeMap::new();
        let mut manifest = None;
        let mut metadata = None;

        let mut header = [0u8; BLOCK];
        loop {
            if !read_block(&mut decoder, &mut header)? {
                return Err(VerifyError::Header("archive ended without end-of-archive marker".to_string()));
            }
            if header.iter().all(|b| *b == 0) {
                break;
            }

            let entry = parse_header(&header)?;
            let keep = entry.name == SUMS_MEMBER || entry.name == META_MEMBER;
            let mut hasher = Sha256::new();
            let mut kept = Vec::new();
            let mut remaining = entry.size;
            let mut buf = [0u8; 8192];

            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                decoder.read_exact(&mut buf[..want])?;
                hasher.update(&buf[..want]);
                if keep {
                    kept.extend_from_slice(&buf[..want]);
                }
                remaining -= want as u64;
            }
            skip_padding(&mut decoder, entry.size)?;

            if !entry.regular {
                continue;
            }
            match entry.name.as_str() {
                SUMS_MEMBER => manifest = Some(kept),
                META_MEMBER => {
                    metadata = Some(
                        serde_json::from_slice(&kept).map_err(|e| VerifyError::Metadata(e.to_string()))?,
                    );
                    digests.insert(entry.name, hex(&hasher.finalize()));
                }
                _ => {
                    digests.insert(entry.name, hex(&hasher.finalize()));
                }
            }
        }

        // Reaching EOF lets the decoder check the gzip trailer CRC
        io::copy(&mut decoder, &mut io::sink())?;
        let trailing = io::copy(&mut decoder.into_inner(), &mut io::sink())?;
        if trailing > 0 {
            return Err(VerifyError::TrailingData(trailing));
        }

        let manifest = manifest.ok_or_else(|| VerifyError::MissingMember(SUMS_MEMBER.to_string()))?;
        let metadata = metadata.ok_or_else(|| VerifyError::MissingMember(META_MEMBER.to_string()))?;

        let manifest = String::from_utf8(manifest).map_err(|e| VerifyError::Manifest(e.to_string()))?;
        let mut listed = BTreeSet::new();
        for line in manifest.lines().filter(|l| !l.trim().is_empty()) {
            let (expected, member) = line
                .split_once(char::is_whitespace)
                .map(|(digest, name)| (digest.trim(), name.trim()))
                .ok_or_else(|| VerifyError::Manifest(line.to_string()))?;

            let actual = digests
                .get(member)
                .ok_or_else(|| VerifyError::MissingMember(member.to_string()))?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(VerifyError::Checksum {
                    member: member.to_string(),
                    expected: expected.to_string(),
                    actual: actual.clone(),
                });
            }
            listed.insert(member.to_string());
        }

        for required in [META_MEMBER, STATE_MEMBER] {
            if !digests.contains_key(required) {
                return Err(VerifyError::MissingMember(required.to_string()));
            }
        }
        if let Some(unlisted) = digests.keys().find(|name| !listed.contains(*name)) {
            return Err(VerifyError::Unlisted(unlisted.clone()));
        }

        Ok(VerifiedArchive {
            members: digests,
            metadata,
        })
    }
}

struct EntryHeader {
    name: String,
    size: u64,
    regular: bool,
}

/// Fill `block` completely; `Ok(false)` on a clean EOF before the first byte
fn read_block(reader: &mut impl Read, block: &mut [u8; BLOCK]) -> Result<bool, VerifyError> {
    let mut filled = 0;
    while filled < BLOCK {
        match reader.read(&mut block[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(VerifyError::Header("truncated header block".to_string())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn skip_padding(reader: &mut impl Read, size: u64) -> Result<(), VerifyError> {
    let pad = (BLOCK as u64 - size % BLOCK as u64) % BLOCK as u64;
    if pad > 0 {
        let mut buf = [0u8; BLOCK];
        reader.read_exact(&mut buf[..pad as usize])?;
    }
    Ok(())
}

fn parse_header(header: &[u8; BLOCK]) -> Result<EntryHeader, VerifyError> {
    let stored = parse_octal(&header[148..156])?;
    let computed: u64 = header
        .iter()
        .enumerate()
        .map(|(i, b)| if (148..156).contains(&i) { b' ' as u64 } else { *b as u64 })
        .sum();
    if stored != computed {
        return Err(VerifyError::Header(format!(
            "header checksum {} does not match computed {}",
            stored, computed
        )));
    }

    let name = field_str(&header[0..100]);
    let prefix = if &header[257..262] == b"ustar" {
        field_str(&header[345..500])
    } else {
        String::new()
    };
    let name = if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    };

    let size = parse_octal(&header[124..136])?;
    let regular = matches!(header[156], b'0' | 0);

    Ok(EntryHeader { name, size, regular })
}

fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn parse_octal(field: &[u8]) -> Result<u64, VerifyError> {
    if field.first().is_some_and(|b| b & 0x80 != 0) {
        return Err(VerifyError::Header("base-256 numeric fields are not supported".to_string()));
    }
    let text = field_str(field);
    let text = text.trim_matches(|c: char| c == ' ' || c == '\0');
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8).map_err(|e| VerifyError::Header(format!("bad numeric field {:?}: {}", text, e)))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Assembles a snapshot archive with a matching `SHA256SUMS` manifest
#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    members: Vec<(String, Vec<u8>)>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member; the manifest is generated on [`ArchiveBuilder::finish`]
    pub fn member(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.members.push((name.into(), data));
        self
    }

    /// Produce the compressed archive bytes
    pub fn finish(self) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

        let mut manifest = String::new();
        for (name, data) in &self.members {
            manifest.push_str(&format!("{}  {}\n", hex(&Sha256::digest(data)), name));
        }

        for (name, data) in &self.members {
            write_member(&mut encoder, name, data)?;
        }
        write_member(&mut encoder, SUMS_MEMBER, manifest.as_bytes())?;
        encoder.write_all(&[0u8; BLOCK * 2])?;
        encoder.finish()
    }
}

fn write_member(out: &mut impl Write, name: &str, data: &[u8]) -> io::Result<()> {
    if name.len() > 100 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("member name too long: {}", name)));
    }

    let mut header = [0u8; BLOCK];
    header[..name.len()].copy_from_slice(name.as_bytes());
    header[100..108].copy_from_slice(b"0000644\0");
    header[108..116].copy_from_slice(b"0000000\0");
    header[116..124].copy_from_slice(b"0000000\0");
    header[124..136].copy_from_slice(format!("{:011o}\0", data.len()).as_bytes());
    header[136..148].copy_from_slice(b"00000000000\0");
    header[156] = b'0';
    header[257..263].copy_from_slice(b"ustar\0");
    header[263..265].copy_from_slice(b"00");

    header[148..156].fill(b' ');
    let checksum: u64 = header.iter().map(|b| *b as u64).sum();
    header[148..156].copy_from_slice(format!("{:06o}\0 ", checksum).as_bytes());

    out.write_all(&header)?;
    out.write_all(data)?;
    let pad = (BLOCK - data.len() % BLOCK) % BLOCK;
    out.write_all(&vec![0u8; pad])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ArchiveBuilder {
        ArchiveBuilder::new()
            .member(META_MEMBER, br#"{"Index":42,"Term":3,"Version":1}"#.to_vec())
            .member(STATE_MEMBER, (0..5000u32).flat_map(|i| i.to_le_bytes()).collect())
    }

    #[test]
    fn test_valid_archive_verifies() {
        let bytes = sample().finish().unwrap();

        let verified = ArchiveVerifier::new().verify(&mut bytes.as_slice()).unwrap();

        assert_eq!(verified.metadata["Index"], 42);
        assert!(verified.members.contains_key("state.bin"));
        assert!(verified.members.contains_key(META_MEMBER));
    }

    #[test]
    fn test_truncated_archive_is_rejected() {
        let bytes = sample().finish().unwrap();
        let truncated = &bytes[..bytes.len() / 2];

        assert!(ArchiveVerifier::new().verify(&mut &truncated[..]).is_err());
    }

    #[test]
    fn test_tampered_member_fails_checksum() {
        let mut tar = Vec::new();
        let meta = br#"{"Index":1}"#;
        write_member(&mut tar, META_MEMBER, meta).unwrap();
        write_member(&mut tar, "state.bin", b"tampered").unwrap();
        let manifest = format!(
            "{}  {}\n{}  state.bin\n",
            hex(&Sha256::digest(meta)),
            META_MEMBER,
            hex(&Sha256::digest(b"original"))
        );
        write_member(&mut tar, SUMS_MEMBER, manifest.as_bytes()).unwrap();
        tar.extend_from_slice(&[0u8; BLOCK * 2]);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        let bytes = encoder.finish().unwrap();

        let err = ArchiveVerifier::new().verify(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, VerifyError::Checksum { ref member, .. } if member == "state.bin"));
    }

    #[test]
    fn test_missing_manifest_is_rejected() {
        let mut tar = Vec::new();
        write_member(&mut tar, META_MEMBER, b"{}").unwrap();
        tar.extend_from_slice(&[0u8; BLOCK * 2]);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        let bytes = encoder.finish().unwrap();

        let err = ArchiveVerifier::new().verify(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, VerifyError::MissingMember(ref name) if name == SUMS_MEMBER));
    }

    fn gzip(tar: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(tar).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_archive_without_state_is_rejected() {
        let bytes = ArchiveBuilder::new()
            .member(META_MEMBER, br#"{"Index":9}"#.to_vec())
            .finish()
            .unwrap();

        let err = ArchiveVerifier::new().verify(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, VerifyError::MissingMember(ref name) if name == STATE_MEMBER));
    }

    #[test]
    fn test_unlisted_member_is_rejected() {
        let mut tar = Vec::new();
        let meta = br#"{"Index":2}"#;
        write_member(&mut tar, META_MEMBER, meta).unwrap();
        write_member(&mut tar, STATE_MEMBER, b"state").unwrap();
        let manifest = format!("{}  {}\n", hex(&Sha256::digest(meta)), META_MEMBER);
        write_member(&mut tar, SUMS_MEMBER, manifest.as_bytes()).unwrap();
        tar.extend_from_slice(&[0u8; BLOCK * 2]);

        let err = ArchiveVerifier::new().verify(&mut gzip(&tar).as_slice()).unwrap_err();
        assert!(matches!(err, VerifyError::Unlisted(ref name) if name == STATE_MEMBER));
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = sample().finish().unwrap();
        bytes.extend_from_slice(&[0xab; 28]);

        let err = ArchiveVerifier::new().verify(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, VerifyError::TrailingData(28)));
    }

    #[test]
    fn test_plain_bytes_are_rejected() {
        let err = ArchiveVerifier::new().verify(&mut &b"not a snapshot"[..]).unwrap_err();
        assert!(matches!(err, VerifyError::Io(_) | VerifyError::Header(_)));
    }
}
