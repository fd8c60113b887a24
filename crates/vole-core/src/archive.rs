// Archive — little-endian binary stream primitives
//
// Networks, nodes and solvers serialize themselves through these two types.
// Every multi-byte value is little-endian; strings and tensors are length
// prefixed:
//
//   string: len u32 LE, then UTF-8 bytes
//   tensor: ndim u32 LE, dims [u32 LE; ndim], data [f32 LE; elem_count]
//
// The reader validates every length against sane bounds before allocating,
// so a truncated or corrupted archive produces `Error::Archive` instead of a
// huge allocation.

use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

const MAX_STRING_LEN: usize = 1 << 20;
const MAX_RANK: usize = 16;
const MAX_ELEMENTS: usize = 1 << 28;

/// Writes archive primitives to any `Write`.
pub struct ArchiveWriter<W: Write> {
    inner: W,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        ArchiveWriter { inner }
    }

    /// Unwrap the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data)?;
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_bytes(&[v])
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        self.write_bytes(&v.to_le_bytes())
    }

    /// Write a `usize` as u32, failing if it does not fit.
    pub fn write_len(&mut self, v: usize) -> Result<()> {
        let v = u32::try_from(v).map_err(|_| Error::archive(format!("length {v} exceeds u32")))?;
        self.write_u32(v)
    }

    pub fn write_str(&mut self, s: &str) -> Result<()> {
        self.write_len(s.len())?;
        self.write_bytes(s.as_bytes())
    }

    pub fn write_f32_slice(&mut self, data: &[f32]) -> Result<()> {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write_bytes(&bytes)
    }

    /// Write a tensor's shape and data. Borrowed handles are fine: only a
    /// read lock is taken.
    pub fn write_tensor(&mut self, t: &Tensor) -> Result<()> {
        self.write_len(t.dims().len())?;
        for &d in t.dims() {
            self.write_len(d)?;
        }
        let data = t.read();
        self.write_f32_slice(&data)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Reads archive primitives from any `Read`.
pub struct ArchiveReader<R: Read> {
    inner: R,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        ArchiveReader { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::archive("unexpected end of archive")
            } else {
                Error::Io(e)
            }
        })
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(Error::archive(format!("invalid bool byte {v}"))),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(f32::from_le_bytes(b))
    }

    pub fn read_len(&mut self) -> Result<usize> {
        Ok(self.read_u32()? as usize)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_len()?;
        if len > MAX_STRING_LEN {
            return Err(Error::archive(format!("string length {len} too large")));
        }
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| Error::archive(format!("invalid UTF-8: {e}")))
    }

    pub fn read_f32_vec(&mut self, count: usize) -> Result<Vec<f32>> {
        if count > MAX_ELEMENTS {
            return Err(Error::archive(format!("element count {count} too large")));
        }
        let mut buf = vec![0u8; count * 4];
        self.read_exact(&mut buf)?;
        Ok(buf
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Read a tensor written by [`ArchiveWriter::write_tensor`]. The result
    /// is always an owned tensor.
    pub fn read_tensor(&mut self) -> Result<Tensor> {
        let rank = self.read_len()?;
        if rank > MAX_RANK {
            return Err(Error::archive(format!("tensor rank {rank} too large")));
        }
        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(self.read_len()?);
        }
        let shape = Shape::new(dims);
        let count = shape
            .dims()
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| Error::archive(format!("tensor shape {shape} overflows")))?;
        let data = self.read_f32_vec(count)?;
        Tensor::from_vec(data, shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_primitives_and_tensor() {
        let mut w = ArchiveWriter::new(Vec::new());
        w.write_u8(7).unwrap();
        w.write_bool(true).unwrap();
        w.write_u64(u64::MAX - 1).unwrap();
        w.write_f32(-1.5).unwrap();
        w.write_str("fc1").unwrap();
        let t = Tensor::from_vec(vec![1.0, -2.0, 3.5, 0.0, 9.0, 1e-3], (2, 3)).unwrap();
        w.write_tensor(&t.share()).unwrap();
        let bytes = w.into_inner();

        let mut r = ArchiveReader::new(Cursor::new(bytes));
        assert_eq!(r.read_u8().unwrap(), 7);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.read_f32().unwrap(), -1.5);
        assert_eq!(r.read_string().unwrap(), "fc1");
        let back = r.read_tensor().unwrap();
        assert!(back.bitwise_eq(&t));
        assert_eq!(back.provenance(), crate::tensor::Provenance::Owned);
    }

    #[test]
    fn test_truncated_archive_is_an_archive_error() {
        let mut w = ArchiveWriter::new(Vec::new());
        w.write_tensor(&Tensor::zeros((4, 4))).unwrap();
        let mut bytes = w.into_inner();
        bytes.truncate(bytes.len() - 3);

        let mut r = ArchiveReader::new(Cursor::new(bytes));
        assert!(matches!(r.read_tensor(), Err(Error::Archive(_))));
    }

    #[test]
    fn test_invalid_bool() {
        let mut r = ArchiveReader::new(Cursor::new(vec![2u8]));
        assert!(r.read_bool().is_err());
    }
}
