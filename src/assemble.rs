//! Signed image assembly.
//!
//! The signed image is the source record stream with the reserved metadata
//! region and the signature block spliced in right after its first line:
//!
//! ```text
//! <source line 1>            passed through verbatim
//! <16 metadata records>      0x0000..=0x00FF
//! <signature records>        0x0110, 0x0120, ...
//! <source lines 2..N>        passed through verbatim
//! ```

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::metadata::MetadataHeader;
use crate::record::{LineEnding, BLOCK_LINE_LEN};
use crate::signature::{encode_signature_records, read_signature_lines};
use crate::{HexSignError, Result};

/// Suffix appended to the source path to name the signed image.
pub const SIGNED_SUFFIX: &str = ".signed";

#[cfg(unix)]
const OUTPUT_MODE: u32 = 0o644;

/// Splices the metadata and signature records into a source record stream.
#[derive(Debug, Clone)]
pub struct SignedImageAssembler {
    metadata: MetadataHeader,
    line_ending: LineEnding,
}

impl SignedImageAssembler {
    pub fn new(metadata: MetadataHeader, line_ending: LineEnding) -> Self {
        Self {
            metadata,
            line_ending,
        }
    }

    /// Assemble the signed image in memory.
    ///
    /// Nothing is returned unless every step succeeds, so a caller that only
    /// writes the returned buffer never leaves a partial image behind.
    pub fn assemble<R: BufRead, S: AsRef<[u8]>>(
        &self,
        mut source: R,
        signature_lines: &[S],
    ) -> Result<Vec<u8>> {
        let mut header = Vec::new();
        if source.read_until(b'\n', &mut header)? == 0 {
            return Err(HexSignError::TruncatedSourceStream);
        }

        let (meta_records, next_address) = self.metadata.records();
        let (sig_records, _) = encode_signature_records(signature_lines, next_address)?;

        let eol = self.line_ending.as_str();
        let line_len = BLOCK_LINE_LEN + eol.len();
        let mut out = Vec::with_capacity(
            header.len() + (meta_records.len() + sig_records.len()) * line_len,
        );
        out.extend_from_slice(&header);
        // A header without terminator would run into the first metadata record.
        if !header.ends_with(b"\n") {
            out.extend_from_slice(eol.as_bytes());
        }
        for record in meta_records.iter().chain(&sig_records) {
            out.extend_from_slice(record.encode(self.line_ending).as_bytes());
        }

        let body_start = out.len();
        source.read_to_end(&mut out)?;
        debug!(
            "spliced {} metadata + {} signature records, {} bytes of image records follow",
            meta_records.len(),
            sig_records.len(),
            out.len() - body_start
        );

        Ok(out)
    }

    /// Assemble from files and commit `output` atomically.
    pub fn assemble_file(
        &self,
        source: impl AsRef<Path>,
        signature: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> Result<()> {
        let source = source.as_ref();
        let signature = signature.as_ref();
        let output = output.as_ref();

        ensure_exists(source, "Intel HEX")?;
        ensure_exists(signature, "signature")?;

        let lines = read_signature_lines(BufReader::new(fs::File::open(signature)?))?;
        let image = self.assemble(BufReader::new(fs::File::open(source)?), &lines)?;
        write_atomic(output, &image)?;

        info!(
            "wrote signed image {} ({} signature lines)",
            output.display(),
            lines.len()
        );
        Ok(())
    }
}

/// `<source><suffix>`, e.g. `app.hex` → `app.hex.signed`.
pub fn signed_output_path(source: impl AsRef<Path>, suffix: &str) -> PathBuf {
    let mut name = source.as_ref().as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) fn ensure_exists(path: &Path, kind: &'static str) -> Result<()> {
    if !path.is_file() {
        return Err(HexSignError::MissingArtifact {
            kind,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Write `data` to `path` through a temporary file in the same directory,
/// renamed into place once fully written.
///
/// On Unix the file ends up with mode `0644`, like a plainly created file
/// under the usual umask.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(OUTPUT_MODE))?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| HexSignError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::METADATA_RECORD_COUNT;
    use crate::record::Record;

    const SOURCE: &str = ":020000040000FA\r\n\
                          :1000000000040010490100005101000053010000EC\r\n\
                          :040010005501000096\r\n\
                          :00000001FF\r\n";

    const SIG: [&str; 3] = [
        "00112233445566778899AABBCCDDEEFF",
        "0F0E0D0C0B0A09080706050403020100",
        "DEADBEEFDEADBEEFDEADBEEFDEADBEEF",
    ];

    fn assembler() -> SignedImageAssembler {
        SignedImageAssembler::new(
            MetadataHeader::new(0x1000, 0x2000, 0x1000_0000, 0x4000),
            LineEnding::Crlf,
        )
    }

    #[test]
    fn splices_records_after_first_line() {
        let out = assembler().assemble(SOURCE.as_bytes(), &SIG).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let src: Vec<&str> = SOURCE.split_inclusive('\n').collect();

        assert_eq!(lines.len(), src.len() + METADATA_RECORD_COUNT + SIG.len());
        assert_eq!(lines[0], src[0]);

        let inserted = &lines[1..1 + METADATA_RECORD_COUNT + SIG.len()];
        for (i, line) in inserted.iter().enumerate() {
            let rec = Record::parse(line).unwrap();
            let expected = if i < METADATA_RECORD_COUNT {
                i * 16
            } else {
                272 + (i - METADATA_RECORD_COUNT) * 16
            };
            assert_eq!(rec.address() as usize, expected);
            assert!(line.ends_with("\r\n"));
        }
        assert_eq!(
            Record::parse(inserted[0]).unwrap().payload(),
            &[0x00, 0x10, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x40, 0x00, 0x00]
        );
        assert_eq!(
            Record::parse(inserted[METADATA_RECORD_COUNT + 2]).unwrap().payload(),
            &[0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD, 0xBE, 0xEF]
        );

        assert_eq!(&lines[1 + inserted.len()..], &src[1..]);
    }

    #[test]
    fn single_line_source() {
        let out = assembler()
            .assemble(":00000001FF\n".as_bytes(), &SIG[..1])
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1 + METADATA_RECORD_COUNT + 1);
        assert!(text.starts_with(":00000001FF\n:10000000"));
    }

    #[test]
    fn unterminated_header_gets_line_ending() {
        let asm = SignedImageAssembler::new(MetadataHeader::default(), LineEnding::Lf);
        let lines: [&str; 0] = [];
        let text = String::from_utf8(asm.assemble(":00000001FF".as_bytes(), &lines).unwrap()).unwrap();
        assert!(text.starts_with(":00000001FF\n:10000000"));
    }

    #[test]
    fn lf_line_endings() {
        let asm = SignedImageAssembler::new(MetadataHeader::default(), LineEnding::Lf);
        let out = asm.assemble(SOURCE.as_bytes(), &SIG).unwrap();
        let text = String::from_utf8(out).unwrap();
        let inserted: Vec<&str> = text.split_inclusive('\n').skip(1).take(19).collect();
        assert!(inserted.iter().all(|l| !l.ends_with("\r\n")));
    }

    #[test]
    fn empty_source_is_truncated() {
        let err = assembler().assemble("".as_bytes(), &SIG).unwrap_err();
        assert!(matches!(err, HexSignError::TruncatedSourceStream));
    }

    #[test]
    fn malformed_signature_aborts() {
        let bad = [SIG[0], "00112233"];
        let err = assembler().assemble(SOURCE.as_bytes(), &bad).unwrap_err();
        assert!(matches!(
            err,
            HexSignError::MalformedSignatureLine { line: 2, .. }
        ));
    }

    #[test]
    fn assemble_file_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("app.hex");
        let sig = dir.path().join("app.sig");
        fs::write(&src, SOURCE).unwrap();
        fs::write(&sig, SIG.join("\r\n")).unwrap();

        let out = signed_output_path(&src, SIGNED_SUFFIX);
        assert_eq!(out, dir.path().join("app.hex.signed"));
        assembler().assemble_file(&src, &sig, &out).unwrap();

        let text = fs::read_to_string(&out).unwrap();
        assert_eq!(text.lines().count(), 4 + METADATA_RECORD_COUNT + SIG.len());
    }

    #[test]
    fn failed_assembly_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("app.hex");
        let sig = dir.path().join("app.sig");
        fs::write(&src, SOURCE).unwrap();
        fs::write(&sig, "not hex at all\n").unwrap();

        let out = signed_output_path(&src, SIGNED_SUFFIX);
        let err = assembler().assemble_file(&src, &sig, &out).unwrap_err();
        assert!(matches!(err, HexSignError::MalformedSignatureLine { .. }));
        assert!(!out.exists());
        // Only the two inputs remain; no stray temp file either.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn failed_assembly_keeps_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("app.hex");
        let sig = dir.path().join("app.sig");
        let out = signed_output_path(&src, SIGNED_SUFFIX);
        fs::write(&src, "").unwrap();
        fs::write(&sig, SIG.join("\n")).unwrap();
        fs::write(&out, "previous").unwrap();

        let err = assembler().assemble_file(&src, &sig, &out).unwrap_err();
        assert!(matches!(err, HexSignError::TruncatedSourceStream));
        assert_eq!(fs::read_to_string(&out).unwrap(), "previous");
    }

    #[test]
    fn non_utf8_signature_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("app.hex");
        let sig = dir.path().join("app.sig");
        let out = signed_output_path(&src, SIGNED_SUFFIX);
        fs::write(&src, SOURCE).unwrap();
        let mut data = format!("{}\n", SIG[0]).into_bytes();
        data.extend_from_slice(b"00112233445566778899AABBCCDDEE\xC3(\n");
        fs::write(&sig, data).unwrap();

        let err = assembler().assemble_file(&src, &sig, &out).unwrap_err();
        assert!(matches!(
            err,
            HexSignError::MalformedSignatureLine { line: 2, .. }
        ));
        assert!(!out.exists());
    }

    #[cfg(unix)]
    #[test]
    fn output_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("app.hex.signed");
        write_atomic(&out, b":00000001FF\r\n").unwrap();
        let mode = fs::metadata(&out).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn capacity_matches_block_line() {
        let line = Record::block(0x0100, [0xAB; 16]).encode(LineEnding::Lf);
        assert_eq!(line.len(), BLOCK_LINE_LEN + 1);
    }

    #[test]
    fn missing_inputs_reported() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("missing.hex");
        let err = assembler()
            .assemble_file(&src, dir.path().join("x.sig"), dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(
            err,
            HexSignError::MissingArtifact { kind: "Intel HEX", .. }
        ));
    }
}
