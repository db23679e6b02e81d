//! Subversion dump-stream writer (`SVN-fs-dump-format-version: 2`).
//!
//! Writing is single-threaded and append-only.  The writer tracks the byte
//! offset of the stream so checkpoints can record revision boundaries.

use std::io::Write;

use indexmap::IndexMap;

use crate::cache::{md5_hex, BlobReader};
use crate::errors::ConvertResult;
use crate::models::{NodeContent, NodeOp, RevisionRecord};

pub const DUMP_HEADER: &[u8] = b"SVN-fs-dump-format-version: 2\n\n";

/// Serialized property block: `K n`/`V n` pairs followed by `PROPS-END`.
pub fn props_block(props: &IndexMap<String, String>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in props {
        out.extend_from_slice(format!("K {}\n{key}\nV {}\n{value}\n", key.len(), value.len()).as_bytes());
    }
    out.extend_from_slice(b"PROPS-END\n");
    out
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub struct DumpWriter<W: Write> {
    out: CountingWriter<W>,
}

impl<W: Write> DumpWriter<W> {
    pub fn new(out: W) -> Self {
        Self::resume(out, 0)
    }

    /// Continue a stream that already holds `offset` bytes.
    pub fn resume(out: W, offset: u64) -> Self {
        Self {
            out: CountingWriter {
                inner: out,
                written: offset,
            },
        }
    }

    pub fn offset(&self) -> u64 {
        self.out.written
    }

    pub fn write_header(&mut self) -> ConvertResult<()> {
        self.out.write_all(DUMP_HEADER)?;
        Ok(())
    }

    /// Write one revision.  Records without node operations are skipped.
    pub fn write_record(&mut self, record: &RevisionRecord, blobs: &dyn BlobReader) -> ConvertResult<bool> {
        if record.ops.is_empty() {
            return Ok(false);
        }
        let props = props_block(&record.revision_props()?);
        write!(
            self.out,
            "Revision-number: {}\nProp-content-length: {}\nContent-length: {}\n\n",
            record.number,
            props.len(),
            props.len()
        )?;
        self.out.write_all(&props)?;
        self.out.write_all(b"\n")?;
        for op in &record.ops {
            self.write_node(op, blobs)?;
        }
        Ok(true)
    }

    fn write_node(&mut self, op: &NodeOp, blobs: &dyn BlobReader) -> ConvertResult<()> {
        let mut head = format!("Node-path: {}\n", op.path);
        if let Some(kind) = op.kind {
            head.push_str(&format!("Node-kind: {}\n", kind.as_str()));
        }
        head.push_str(&format!("Node-action: {}\n", op.action.as_str()));
        if let Some(from) = &op.copy_from {
            head.push_str(&format!(
                "Node-copyfrom-rev: {}\nNode-copyfrom-path: {}\n",
                from.revision, from.path
            ));
        }

        let props = op.props.as_ref().map(props_block);
        let text = match &op.content {
            Some(NodeContent::Inline(bytes)) => Some((bytes.clone(), md5_hex(bytes))),
            Some(NodeContent::Cached(blob)) => Some((blobs.read_blob(blob)?, blob.md5.clone())),
            None => None,
        };
        if props.is_none() && text.is_none() {
            head.push_str("\n\n");
            self.out.write_all(head.as_bytes())?;
            return Ok(());
        }

        let prop_len = props.as_ref().map_or(0, Vec::len);
        if let Some(props) = &props {
            head.push_str(&format!("Prop-content-length: {}\n", props.len()));
        }
        if let Some((bytes, md5)) = &text {
            head.push_str(&format!(
                "Text-content-length: {}\nText-content-md5: {md5}\n",
                bytes.len()
            ));
        }
        let text_len = text.as_ref().map_or(0, |(bytes, _)| bytes.len());
        head.push_str(&format!("Content-length: {}\n\n", prop_len + text_len));
        self.out.write_all(head.as_bytes())?;
        if let Some(props) = &props {
            self.out.write_all(props)?;
        }
        if let Some((bytes, _)) = &text {
            self.out.write_all(bytes)?;
        }
        self.out.write_all(b"\n\n")?;
        Ok(())
    }

    pub fn flush(&mut self) -> ConvertResult<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out.inner
    }
}
