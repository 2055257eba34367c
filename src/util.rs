use std::io::{self, Read};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

pub(crate) trait SliceExtension<T> {
    /// Borrows `N` consecutive elements starting at `index` as a fixed-size array
    ///
    /// Returns None when fewer than `N` elements remain.
    #[allow(dead_code)] // only used by optional format modules
    fn select_array<const N: usize>(&self, index: usize) -> Option<&[T; N]>;
}

impl<T> SliceExtension<T> for [T] {
    fn select_array<const N: usize>(&self, index: usize) -> Option<&[T; N]> {
        let end = index.checked_add(N)?;
        self.get(index..end)
            .and_then(|slice| <&[T; N]>::try_from(slice).ok())
    }
}

/// Byte order of a binary stream
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    /// Byte order of the machine we are running on
    pub const fn host() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }
}

/// Reader for binary data of a fixed byte order
///
/// The byte order is chosen once per stream; conversion to host order happens on each read.
pub struct EndianReader<R> {
    inner: R,
    order: Endianness,
}

impl<R: Read> EndianReader<R> {
    pub fn new(inner: R, order: Endianness) -> Self {
        EndianReader { inner, order }
    }

    pub fn read_u8(&mut self) -> io::Result<u8> {
        self.inner.read_u8()
    }

    pub fn read_u16(&mut self) -> io::Result<u16> {
        match self.order {
            Endianness::Little => self.inner.read_u16::<LittleEndian>(),
            Endianness::Big => self.inner.read_u16::<BigEndian>(),
        }
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        match self.order {
            Endianness::Little => self.inner.read_u32::<LittleEndian>(),
            Endianness::Big => self.inner.read_u32::<BigEndian>(),
        }
    }

    pub fn read_i32(&mut self) -> io::Result<i32> {
        match self.order {
            Endianness::Little => self.inner.read_i32::<LittleEndian>(),
            Endianness::Big => self.inner.read_i32::<BigEndian>(),
        }
    }

    pub fn read_u64(&mut self) -> io::Result<u64> {
        match self.order {
            Endianness::Little => self.inner.read_u64::<LittleEndian>(),
            Endianness::Big => self.inner.read_u64::<BigEndian>(),
        }
    }

    pub fn read_f32(&mut self) -> io::Result<f32> {
        match self.order {
            Endianness::Little => self.inner.read_f32::<LittleEndian>(),
            Endianness::Big => self.inner.read_f32::<BigEndian>(),
        }
    }

    pub fn read_f64(&mut self) -> io::Result<f64> {
        match self.order {
            Endianness::Little => self.inner.read_f64::<LittleEndian>(),
            Endianness::Big => self.inner.read_f64::<BigEndian>(),
        }
    }

    /// Discards `count` bytes
    pub fn skip(&mut self, count: u64) -> io::Result<()> {
        let copied = io::copy(&mut (&mut self.inner).take(count), &mut io::sink())?;
        if copied < count {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, format!("expected {} more bytes, found {}", count, copied)))
        } else {
            Ok(())
        }
    }
}
