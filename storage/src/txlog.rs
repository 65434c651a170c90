use crate::store::TxRecord;
use mnemolite_core::error::{ErrorKind, KindedError};
use std::path::Path;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{info, warn};

/// Leading byte of every committed transaction frame. Anything else at a
/// frame boundary means the log bytes are not ours.
const FRAME_MARKER: u8 = 0xA7;

#[derive(Error, Debug)]
pub enum TxLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transaction {sequence} is corrupt: {reason}")]
    Corrupt { sequence: u64, reason: String },
    #[error("transaction with {ops} ops exceeds the frame limit")]
    Oversized { ops: usize },
    #[error("transaction encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl KindedError for TxLogError {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::PersistError
    }
}

/// Append-only log of store transactions.
///
/// Each committed transaction is one frame:
/// `[marker:1][op_count:2][payload_len:4][payload_crc:4][payload]`,
/// payload being the JSON-encoded op batch. The op count is redundant
/// with the payload and cross-checked on replay, so a misframed record
/// cannot be applied. Sequence numbers are positional: the n-th intact
/// frame is transaction n. A torn frame at the tail (crash mid-commit)
/// is truncated on replay; a bad marker, checksum or op count mid-log is
/// an integrity failure and refuses to load.
pub struct TxLog {
    file: BufWriter<File>,
    committed: u64,
}

impl TxLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TxLogError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await?;

        Ok(Self {
            file: BufWriter::new(file),
            committed: 0,
        })
    }

    /// Encode and append one transaction. The frame is buffered; it is
    /// durable only after `sync`. Returns the transaction sequence.
    pub async fn append_transaction(&mut self, record: &TxRecord) -> Result<u64, TxLogError> {
        let payload = serde_json::to_vec(record)?;
        let op_count = u16::try_from(record.ops.len()).map_err(|_| TxLogError::Oversized {
            ops: record.ops.len(),
        })?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        self.file.write_u8(FRAME_MARKER).await?;
        self.file.write_u16(op_count).await?;
        self.file.write_u32(payload.len() as u32).await?;
        self.file.write_u32(crc).await?;
        self.file.write_all(&payload).await?;

        self.committed += 1;
        Ok(self.committed)
    }

    /// Make every appended transaction durable (flush + fsync).
    pub async fn sync(&mut self) -> Result<(), TxLogError> {
        self.file.flush().await?;
        self.file.get_ref().sync_all().await?;
        Ok(())
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Decode the log from the start, handing each intact transaction to
    /// `apply` in commit order. A partial frame at the tail is cut off;
    /// corruption anywhere else aborts the load. Returns the number of
    /// transactions recovered.
    pub async fn replay(
        &mut self,
        mut apply: impl FnMut(u64, TxRecord),
    ) -> Result<u64, TxLogError> {
        self.file.flush().await?;
        let file = self.file.get_mut();
        file.seek(std::io::SeekFrom::Start(0)).await?;

        let mut recovered = 0u64;
        let mut intact_end = 0u64;

        loop {
            let sequence = recovered + 1;

            let marker = match file.read_u8().await {
                Ok(byte) => byte,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(TxLogError::Io(e)),
            };
            if marker != FRAME_MARKER {
                return Err(TxLogError::Corrupt {
                    sequence,
                    reason: format!("bad frame marker 0x{marker:02x}"),
                });
            }

            let header = async {
                let op_count = file.read_u16().await?;
                let payload_len = file.read_u32().await?;
                let crc = file.read_u32().await?;
                Ok::<_, std::io::Error>((op_count, payload_len, crc))
            }
            .await;
            let (op_count, payload_len, crc) = match header {
                Ok(header) => header,
                // Crash mid-header: everything from here on is torn.
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(TxLogError::Io(e)),
            };

            let mut payload = vec![0u8; payload_len as usize];
            match file.read_exact(&mut payload).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(TxLogError::Io(e)),
            }

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != crc {
                return Err(TxLogError::Corrupt {
                    sequence,
                    reason: "payload checksum mismatch".to_string(),
                });
            }

            let record: TxRecord =
                serde_json::from_slice(&payload).map_err(|err| TxLogError::Corrupt {
                    sequence,
                    reason: format!("undecodable op batch: {err}"),
                })?;
            if record.ops.len() != op_count as usize {
                return Err(TxLogError::Corrupt {
                    sequence,
                    reason: format!(
                        "frame announces {op_count} ops, payload holds {}",
                        record.ops.len()
                    ),
                });
            }

            apply(sequence, record);
            recovered = sequence;
            intact_end = file.stream_position().await?;
        }

        let file_len = file.metadata().await?.len();
        if intact_end < file_len {
            warn!(
                torn_bytes = file_len - intact_end,
                "truncating torn transaction at log tail"
            );
            file.set_len(intact_end).await?;
        }

        file.seek(std::io::SeekFrom::End(0)).await?;
        self.committed = recovered;
        info!(transactions = recovered, "transaction log replayed");

        Ok(recovered)
    }
}
