use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use futures::future::try_join_all;

use super::error::{StoreError, StoreResult, catch_not_found};
use super::value::{self, ExternalRef, Value};

/// One persisted entry, the envelope around the stored value.
#[derive(Debug)]
pub(super) struct Record {
    /// Expiry timestamp in milliseconds since the epoch.
    pub expire_time: i64,
    /// The key the entry was written under, kept for collision checks.
    pub key: String,
    pub val: Value,
}

fn zip_ext(zip: bool) -> &'static str {
    if zip { ".gz" } else { "" }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    os.into()
}

/// `<base>.json` or `<base>.json.gz`: the record file itself, and the name
/// the entry lock is scoped to.
pub(super) fn primary_path(base: &Path, zip: bool) -> PathBuf {
    with_suffix(base, &format!(".json{}", zip_ext(zip)))
}

fn sidecar_path(base: &Path, index: usize, zip: bool) -> PathBuf {
    with_suffix(base, &format!("-{index}.bin{}", zip_ext(zip)))
}

/// Decompresses `bytes` if they carry a known magic, passing everything else
/// through untouched.
fn inflate(bytes: Vec<u8>) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match bytes.get(..2) {
        Some([0x1f, 0x8b]) => {
            MultiGzDecoder::new(bytes.as_slice()).read_to_end(&mut out)?;
        }
        Some([0x78, 0x01]) | Some([0x78, 0x9c]) | Some([0x78, 0xda]) => {
            ZlibDecoder::new(bytes.as_slice()).read_to_end(&mut out)?;
        }
        _ => return Ok(bytes),
    }
    Ok(out)
}

fn deflate(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn encode_record(record: Record) -> (serde_json::Value, Vec<Vec<u8>>) {
    let mut sidecars = Vec::new();
    let val = value::encode(record.val, &mut sidecars);
    let json = serde_json::json!({
        "expireTime": record.expire_time,
        "key": record.key,
        "val": val,
    });
    (json, sidecars)
}

fn decode_record(
    json: &serde_json::Value,
    payloads: &mut VecDeque<Vec<u8>>,
) -> StoreResult<Record> {
    let map = json
        .as_object()
        .ok_or_else(|| StoreError::Malformed("record is not an object".into()))?;
    let expire_time = map
        .get("expireTime")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| StoreError::Malformed("missing `expireTime`".into()))?;
    let key = map
        .get("key")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| StoreError::Malformed("missing `key`".into()))?
        .to_owned();
    let val = map
        .get("val")
        .ok_or_else(|| StoreError::Malformed("missing `val`".into()))?;

    Ok(Record {
        expire_time,
        key,
        val: value::decode(val, payloads)?,
    })
}

/// Writes the record file, then all payload files concurrently.
pub(super) async fn write(base: &Path, record: Record, zip: bool) -> StoreResult<()> {
    let (json, sidecars) = encode_record(record);
    let mut bytes = serde_json::to_vec(&json)?;
    if zip {
        bytes = deflate(&bytes)?;
    }
    tokio::fs::write(primary_path(base, zip), bytes).await?;

    let writes = sidecars
        .into_iter()
        .enumerate()
        .map(|(index, payload)| async move {
            let payload = if zip { deflate(&payload)? } else { payload };
            tokio::fs::write(sidecar_path(base, index, zip), payload).await?;
            Ok::<_, StoreError>(())
        });
    try_join_all(writes).await?;
    Ok(())
}

/// Reads and decodes the record at `base`.
///
/// A missing record file surfaces as a `NotFound` I/O error for the caller to
/// interpret. A record that references payload files which are no longer
/// there is broken, not absent, and fails with [`StoreError::Malformed`].
pub(super) async fn read(base: &Path, zip: bool) -> StoreResult<Record> {
    let bytes = tokio::fs::read(primary_path(base, zip)).await?;
    let bytes = if zip {
        inflate(bytes).map_err(|e| StoreError::Malformed(format!("bad compressed record: {e}")))?
    } else {
        bytes
    };
    let json: serde_json::Value = serde_json::from_slice(&bytes)?;

    let refs = value::external_refs(&json);
    let reads = refs.iter().map(|r| read_sidecar(base, *r, zip));
    let mut payloads: VecDeque<_> = try_join_all(reads).await?.into();

    decode_record(&json, &mut payloads)
}

async fn read_sidecar(base: &Path, r: ExternalRef, zip: bool) -> StoreResult<Vec<u8>> {
    let path = sidecar_path(base, r.index, zip);
    let bytes = match catch_not_found(tokio::fs::read(&path).await)? {
        Some(bytes) => bytes,
        None => {
            return Err(StoreError::Malformed(format!(
                "missing payload file `{}`",
                path.display()
            )));
        }
    };
    let bytes = if zip {
        inflate(bytes).map_err(|e| StoreError::Malformed(format!("bad compressed payload: {e}")))?
    } else {
        bytes
    };

    // The record declares the payload size up front; the file fills as much
    // of it as it has.
    let mut payload = vec![0; r.size];
    let n = bytes.len().min(r.size);
    payload[..n].copy_from_slice(&bytes[..n]);
    Ok(payload)
}

/// Removes the record file, then sweeps payload files by increasing index
/// until the first gap.
///
/// A missing record file surfaces as a `NotFound` I/O error.
pub(super) async fn delete(base: &Path, zip: bool) -> StoreResult<()> {
    tokio::fs::remove_file(primary_path(base, zip)).await?;
    for index in 0.. {
        let removed =
            catch_not_found(tokio::fs::remove_file(sidecar_path(base, index, zip)).await)?;
        if removed.is_none() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::test;

    use super::*;

    fn record(key: &str, val: Value) -> Record {
        Record {
            expire_time: 4102444800000,
            key: key.to_owned(),
            val,
        }
    }

    #[tokio::test]
    async fn test_wire_format() {
        test::setup();
        let dir = test::tempdir();
        let base = dir.path().join("entry");

        write(&base, record("greeting", "hello world".into()), false)
            .await
            .unwrap();

        let contents = fs::read_to_string(dir.path().join("entry.json")).unwrap();
        insta::assert_snapshot!(
            contents,
            @r#"{"expireTime":4102444800000,"key":"greeting","val":"hello world"}"#
        );
    }

    #[tokio::test]
    async fn test_roundtrip_with_payload() {
        test::setup();
        let dir = test::tempdir();
        let base = dir.path().join("entry");
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();

        write(&base, record("blob", payload.clone().into()), false)
            .await
            .unwrap();

        assert!(dir.path().join("entry.json").exists());
        assert!(dir.path().join("entry-0.bin").exists());
        assert_eq!(fs::read(dir.path().join("entry-0.bin")).unwrap(), payload);

        let read_back = read(&base, false).await.unwrap();
        assert_eq!(read_back.key, "blob");
        assert_eq!(read_back.val, Value::Bytes(payload));
    }

    #[tokio::test]
    async fn test_compressed_roundtrip() {
        test::setup();
        let dir = test::tempdir();
        let base = dir.path().join("entry");
        let payload = vec![42u8; 4096];

        write(&base, record("blob", payload.clone().into()), true)
            .await
            .unwrap();

        let raw = fs::read(dir.path().join("entry.json.gz")).unwrap();
        assert_eq!(raw[0], 0x78, "record file is not zlib compressed");
        assert!(dir.path().join("entry-0.bin.gz").exists());

        let read_back = read(&base, true).await.unwrap();
        assert_eq!(read_back.val, Value::Bytes(payload));
    }

    #[tokio::test]
    async fn test_missing_payload_is_malformed() {
        test::setup();
        let dir = test::tempdir();
        let base = dir.path().join("entry");

        write(&base, record("blob", vec![1u8; 1500].into()), false)
            .await
            .unwrap();
        fs::remove_file(dir.path().join("entry-0.bin")).unwrap();

        let err = read(&base, false).await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)), "{err:?}");
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_sweep_stops_at_gap() {
        test::setup();
        let dir = test::tempdir();
        let base = dir.path().join("entry");

        let val = Value::Array(vec![vec![1u8; 1500].into(), vec![2u8; 1500].into()]);
        write(&base, record("blob", val), false).await.unwrap();
        // A stray payload file beyond the first gap is not part of the entry.
        fs::write(dir.path().join("entry-5.bin"), b"stray").unwrap();

        delete(&base, false).await.unwrap();

        assert!(!dir.path().join("entry.json").exists());
        assert!(!dir.path().join("entry-0.bin").exists());
        assert!(!dir.path().join("entry-1.bin").exists());
        assert!(dir.path().join("entry-5.bin").exists());
    }

    #[tokio::test]
    async fn test_delete_missing_record() {
        test::setup();
        let dir = test::tempdir();
        let base = dir.path().join("entry");

        let err = delete(&base, false).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
