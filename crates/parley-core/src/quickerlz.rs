//! QuickerLz: the level-1 LZ codec used for oversized command packets.
//!
//! Wire format: a 3-byte header (payloads under 216 bytes) or 9-byte
//! header (u32 little-endian sizes), followed by 32-bit control words
//! interleaved with literals and match tokens. Each control word covers 31
//! tokens; bit 0 is consumed first, a set bit marks a match token.
//!
//! Matches are hash-addressed: the token names a slot of a 4096-entry hash
//! table over 3-byte little-endian windows, and the decompressor resolves
//! it against its own copy of the table. Both sides insert every consumed
//! position into the table, and matches only ever reference offsets at
//! distance >= 3 from the current position, so the referenced entry is one
//! both sides have already inserted.
//!
//! Incompressible data falls back to a stored block (header + raw bytes),
//! which bounds output at `len + 400` for every input.

use crate::error::CompressError;

/// Flag byte bit 0: payload is actually compressed (clear = stored)
const FLAG_COMPRESSED: u8 = 0x01;
/// Flag byte bit 1: 9-byte header with u32 sizes
const FLAG_LONG_HEADER: u8 = 0x02;
/// Flag byte bit 6: format marker, always set
const FLAG_FORMAT: u8 = 0x40;
/// Compression level shifted into bits 2-3; only level 1 exists here
const LEVEL: u8 = 1;

/// Hash table slots (12-bit hash of a 3-byte window)
const HASH_SIZE: usize = 4096;
/// Matches must reach back at least this far
const MIN_OFFSET: usize = 2;
/// Bytes at the tail that are always emitted as literals
const UNCOMPRESSED_END: usize = 4;
/// Uncompressed sizes below this use the 3-byte header
const SHORT_HEADER_LIMIT: usize = 216;
/// Guaranteed allocation bound: output never exceeds `len + 400`
pub const MAX_EXPANSION: usize = 400;

#[inline]
fn read3(data: &[u8], pos: usize) -> u32 {
    u32::from(data[pos]) | u32::from(data[pos + 1]) << 8 | u32::from(data[pos + 2]) << 16
}

#[inline]
fn hash3(fetch: u32) -> usize {
    (((fetch >> 12) ^ fetch) & 0xFFF) as usize
}

fn header_len_for(size: usize) -> usize {
    if size < SHORT_HEADER_LIMIT {
        3
    } else {
        9
    }
}

fn write_header(dst: &mut [u8], compressed: bool, compressed_len: usize, decompressed_len: usize) {
    let long = dst.len() == 9;
    let mut flags = FLAG_FORMAT | (LEVEL << 2);
    if compressed {
        flags |= FLAG_COMPRESSED;
    }
    if long {
        flags |= FLAG_LONG_HEADER;
        dst[0] = flags;
        dst[1..5].copy_from_slice(&(compressed_len as u32).to_le_bytes());
        dst[5..9].copy_from_slice(&(decompressed_len as u32).to_le_bytes());
    } else {
        dst[0] = flags;
        dst[1] = compressed_len as u8;
        dst[2] = decompressed_len as u8;
    }
}

fn stored(data: &[u8]) -> Vec<u8> {
    let header_len = header_len_for(data.len());
    let mut out = vec![0u8; header_len + data.len()];
    write_header(&mut out[..header_len], false, header_len + data.len(), data.len());
    out[header_len..].copy_from_slice(data);
    out
}

/// Compress `data` with the level-1 codec.
///
/// Falls back to a stored block when the data does not compress, so the
/// output length never exceeds `data.len() + 400`.
#[must_use]
pub fn compress(data: &[u8]) -> Vec<u8> {
    let n = data.len();
    let header_len = header_len_for(n);
    let mut dst = vec![0u8; header_len];
    dst.reserve(n);

    let mut cword_pos = dst.len();
    dst.extend_from_slice(&[0u8; 4]);
    let mut cword_val: u32 = 1 << 31;

    let mut table = vec![0usize; HASH_SIZE];
    let mut occupied = vec![false; HASH_SIZE];

    let mut src_pos = 0usize;
    // Positions past this are always literals (room for match extension
    // and the uncompressed tail)
    let last_matchstart = n.wrapping_sub(11);

    while n >= 11 && src_pos <= last_matchstart {
        if cword_val & 1 == 1 {
            // Bail to a stored block when the stream is clearly expanding
            if src_pos > n / 2 && dst.len() > src_pos - (src_pos >> 5) {
                return stored(data);
            }
            dst[cword_pos..cword_pos + 4]
                .copy_from_slice(&((cword_val >> 1) | (1 << 31)).to_le_bytes());
            cword_pos = dst.len();
            dst.extend_from_slice(&[0u8; 4]);
            cword_val = 1 << 31;
        }

        let fetch = read3(data, src_pos);
        let slot = hash3(fetch);
        let candidate = table[slot];
        let usable = occupied[slot];
        table[slot] = src_pos;
        occupied[slot] = true;

        if usable && src_pos - candidate > MIN_OFFSET && read3(data, candidate) == fetch {
            cword_val = (cword_val >> 1) | (1 << 31);
            let remaining = (n - 1 - UNCOMPRESSED_END - src_pos).min(255);
            let mut matchlen = 3usize;
            while matchlen < remaining && data[candidate + matchlen] == data[src_pos + matchlen] {
                matchlen += 1;
            }

            let token = (slot as u32) << 4;
            if matchlen < 18 {
                let word = token | (matchlen as u32 - 2);
                dst.extend_from_slice(&(word as u16).to_le_bytes());
            } else {
                let word = token | ((matchlen as u32) << 16);
                dst.extend_from_slice(&word.to_le_bytes()[..3]);
            }

            // Keep the table in lockstep with the decompressor: interior
            // positions of the match are inserted too
            for pos in src_pos + 1..src_pos + matchlen {
                if pos + 2 < n {
                    let slot = hash3(read3(data, pos));
                    table[slot] = pos;
                    occupied[slot] = true;
                }
            }
            src_pos += matchlen;
        } else {
            cword_val >>= 1;
            dst.push(data[src_pos]);
            src_pos += 1;
        }
    }

    // Literal tail
    while src_pos < n {
        if cword_val & 1 == 1 {
            dst[cword_pos..cword_pos + 4]
                .copy_from_slice(&((cword_val >> 1) | (1 << 31)).to_le_bytes());
            cword_pos = dst.len();
            dst.extend_from_slice(&[0u8; 4]);
            cword_val = 1 << 31;
        }
        cword_val >>= 1;
        dst.push(data[src_pos]);
        src_pos += 1;
    }

    while cword_val & 1 != 1 {
        cword_val >>= 1;
    }
    dst[cword_pos..cword_pos + 4].copy_from_slice(&((cword_val >> 1) | (1 << 31)).to_le_bytes());

    if dst.len() >= n + header_len {
        return stored(data);
    }
    let compressed_len = dst.len();
    write_header(&mut dst[..header_len], true, compressed_len, n);
    dst
}

/// Decompress a QuickerLz block, rejecting outputs larger than `max_size`.
///
/// # Errors
///
/// Returns `CompressError::SizeLimitExceeded` when the header declares a
/// size beyond `max_size`, `CompressError::UnsupportedLevel` for anything
/// but the level-1 format, and `CompressError::TooShort`/`Corrupt` for
/// truncated or inconsistent streams.
pub fn decompress(data: &[u8], max_size: usize) -> Result<Vec<u8>, CompressError> {
    if data.is_empty() {
        return Err(CompressError::TooShort);
    }
    let flags = data[0];
    let level = (flags >> 2) & 0x3;
    if level != LEVEL {
        return Err(CompressError::UnsupportedLevel(level));
    }

    let (header_len, compressed_len, decompressed_len) = if flags & FLAG_LONG_HEADER != 0 {
        if data.len() < 9 {
            return Err(CompressError::TooShort);
        }
        let clen = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
        let dlen = u32::from_le_bytes([data[5], data[6], data[7], data[8]]) as usize;
        (9usize, clen, dlen)
    } else {
        if data.len() < 3 {
            return Err(CompressError::TooShort);
        }
        (3usize, data[1] as usize, data[2] as usize)
    };

    if decompressed_len > max_size {
        return Err(CompressError::SizeLimitExceeded {
            limit: max_size,
            actual: decompressed_len,
        });
    }
    if data.len() < compressed_len {
        return Err(CompressError::TooShort);
    }

    if flags & FLAG_COMPRESSED == 0 {
        let end = header_len
            .checked_add(decompressed_len)
            .ok_or(CompressError::Corrupt("stored size overflow"))?;
        if data.len() < end {
            return Err(CompressError::TooShort);
        }
        return Ok(data[header_len..end].to_vec());
    }

    let mut out: Vec<u8> = Vec::with_capacity(decompressed_len);
    let mut table = vec![0usize; HASH_SIZE];
    let mut occupied = vec![false; HASH_SIZE];
    let mut last_hashed = 0usize; // number of positions inserted so far
    let mut src = header_len;
    let mut cword_val: u32 = 1;

    while out.len() < decompressed_len {
        if cword_val == 1 {
            if src + 4 > data.len() {
                return Err(CompressError::Corrupt("control word truncated"));
            }
            cword_val = u32::from_le_bytes([data[src], data[src + 1], data[src + 2], data[src + 3]]);
            src += 4;
            if cword_val == 0 {
                return Err(CompressError::Corrupt("zero control word"));
            }
        }

        if cword_val & 1 == 1 {
            cword_val >>= 1;
            if src + 2 > data.len() {
                return Err(CompressError::Corrupt("match token truncated"));
            }
            let token = u16::from_le_bytes([data[src], data[src + 1]]);
            let slot = usize::from(token >> 4);
            let len_bits = usize::from(data[src] & 0x0F);
            let matchlen = if len_bits != 0 {
                src += 2;
                len_bits + 2
            } else {
                if src + 3 > data.len() {
                    return Err(CompressError::Corrupt("long match token truncated"));
                }
                let len = usize::from(data[src + 2]);
                src += 3;
                len
            };
            if matchlen < 3 {
                return Err(CompressError::Corrupt("match shorter than 3"));
            }
            if !occupied[slot] {
                return Err(CompressError::Corrupt("match references empty slot"));
            }
            if out.len() + matchlen > decompressed_len {
                return Err(CompressError::Corrupt("match overruns output"));
            }
            let offset = table[slot];
            // Forward byte copy; source and destination may overlap
            for step in 0..matchlen {
                let byte = out[offset + step];
                out.push(byte);
            }
            while last_hashed + 2 < out.len() {
                let slot = hash3(read3(&out, last_hashed));
                table[slot] = last_hashed;
                occupied[slot] = true;
                last_hashed += 1;
            }
        } else {
            cword_val >>= 1;
            let byte = *data
                .get(src)
                .ok_or(CompressError::Corrupt("literal truncated"))?;
            src += 1;
            out.push(byte);
            while last_hashed + 2 < out.len() {
                let slot = hash3(read3(&out, last_hashed));
                table[slot] = last_hashed;
                occupied[slot] = true;
                last_hashed += 1;
            }
        }
    }

    Ok(out)
}
