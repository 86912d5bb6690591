use crate::error::{Result, TsioError};

/// A most-significant-bit-first bitstream reader.
///
/// Used for the H.262 extension headers and the H.264 NAL/slice header
/// prefix fields, including unsigned and signed Exp-Golomb codes.
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
    bit_position: u8,
}

impl<'a> BitReader<'a> {
    /// Creates a reader over `data`, positioned at the first bit.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            bit_position: 0,
        }
    }

    /// Reads `count` bits (at most 32) as an unsigned value.
    pub fn read_bits(&mut self, count: u8) -> Result<u32> {
        if count > 32 {
            return Err(TsioError::InvalidData(
                "cannot read more than 32 bits".into(),
            ));
        }

        let mut result = 0u32;
        let mut bits_left = count;

        while bits_left > 0 {
            if self.position >= self.data.len() {
                return Err(TsioError::InvalidData("reached end of data".into()));
            }

            let byte = self.data[self.position];
            let bits_in_byte = 8 - self.bit_position;
            let bits_to_read = bits_in_byte.min(bits_left);

            let mask = ((1u16 << bits_to_read) - 1) as u8;
            let shifted = (byte >> (8 - self.bit_position - bits_to_read)) & mask;

            result = (result << bits_to_read) | shifted as u32;

            self.bit_position += bits_to_read;
            if self.bit_position >= 8 {
                self.position += 1;
                self.bit_position = 0;
            }

            bits_left -= bits_to_read;
        }

        Ok(result)
    }

    /// Reads `count` bits (at most 64) as an unsigned 64-bit value.
    ///
    /// Needed for the 33-bit timestamp fields.
    pub fn read_bits64(&mut self, count: u8) -> Result<u64> {
        if count > 64 {
            return Err(TsioError::InvalidData(
                "cannot read more than 64 bits".into(),
            ));
        }
        if count <= 32 {
            return Ok(self.read_bits(count)? as u64);
        }
        let high = self.read_bits(count - 32)? as u64;
        let low = self.read_bits(32)? as u64;
        Ok((high << 32) | low)
    }

    /// Reads an unsigned Exp-Golomb code (ue(v)).
    pub fn read_golomb(&mut self) -> Result<u32> {
        let mut leading_zeros = 0u32;

        while self.read_bits(1)? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(TsioError::InvalidData(
                    "exp-golomb code too long".into(),
                ));
            }
        }

        if leading_zeros == 0 {
            return Ok(0);
        }

        let remaining = self.read_bits(leading_zeros as u8)?;
        Ok((1 << leading_zeros) - 1 + remaining)
    }

    /// Reads a signed Exp-Golomb code (se(v)).
    pub fn read_signed_golomb(&mut self) -> Result<i32> {
        let code = self.read_golomb()?;
        let abs = ((code + 1) >> 1) as i32;
        Ok(if code & 1 == 1 { abs } else { -abs })
    }

    /// Skips `count` bits.
    pub fn skip_bits(&mut self, count: u32) -> Result<()> {
        let new_pos = self.position * 8 + self.bit_position as usize + count as usize;
        self.position = new_pos / 8;
        self.bit_position = (new_pos % 8) as u8;

        if self.position > self.data.len() {
            return Err(TsioError::InvalidData(
                "attempted to skip past end of data".into(),
            ));
        }

        Ok(())
    }

    /// True if at least `count` more bits can be read.
    pub fn has_bits(&self, count: usize) -> bool {
        self.position * 8 + self.bit_position as usize + count <= self.data.len() * 8
    }
}
