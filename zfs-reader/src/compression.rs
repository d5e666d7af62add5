use std::io::Read;

use flate2::read::ZlibDecoder;
use nom::combinator::map_res;
use nom::multi::length_data;
use nom::number::complete::be_u32;
use nom::IResult;

use crate::spa::CompressionType;
use crate::{Result, ZfsError};

const LZJB_MATCH_BITS: u32 = 6;
const LZJB_MATCH_MIN: usize = 3;
const LZJB_OFFSET_MASK: usize = (1 << (16 - LZJB_MATCH_BITS)) - 1;
const ZLE_RUN: usize = 64;

/// Decompresses `input` into a block of at most `size` bytes.
///
/// `kind` must already be resolved: `Inherit` is the caller's job.
pub fn decompress(kind: CompressionType, input: &[u8], size: usize) -> Result<Vec<u8>> {
    let mut out = match kind {
        CompressionType::Off => input.to_vec(),
        CompressionType::Empty => vec![0; size],
        CompressionType::On | CompressionType::LZJB => decompress_lzjb(input, size)?,
        CompressionType::LZ4 => decompress_lz4(input)?.1,
        CompressionType::GZIP1
        | CompressionType::GZIP2
        | CompressionType::GZIP3
        | CompressionType::GZIP4
        | CompressionType::GZIP5
        | CompressionType::GZIP6
        | CompressionType::GZIP7
        | CompressionType::GZIP8
        | CompressionType::GZIP9 => decompress_gzip(input, size)?,
        CompressionType::ZLE => decompress_zle(input, size, ZLE_RUN)?,
        CompressionType::Inherit | CompressionType::Zstd => {
            return Err(ZfsError::UnsupportedFeature(format!(
                "compression {:?}",
                kind
            )))
        }
    };
    out.truncate(size);
    Ok(out)
}

pub fn decompress_lz4(input: &[u8]) -> IResult<&[u8], Vec<u8>> {
    map_res(length_data(be_u32), lz4_compression::decompress::decompress)(input)
}

pub fn decompress_gzip(input: &[u8], size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size);
    ZlibDecoder::new(input)
        .take(size as u64)
        .read_to_end(&mut out)?;
    Ok(out)
}

/// Stops when the input runs out, so a short block comes back short.
pub fn decompress_lzjb(input: &[u8], size: usize) -> Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::with_capacity(size);
    let mut src = input.iter().copied();
    let mut copymap = 0u8;
    let mut copymask = 0u32;
    while out.len() < size {
        copymask <<= 1;
        if copymask == 1 << 8 || copymask == 0 {
            copymask = 1;
            copymap = match src.next() {
                Some(b) => b,
                None => break,
            };
        }
        if u32::from(copymap) & copymask != 0 {
            let (b0, b1) = match (src.next(), src.next()) {
                (Some(b0), Some(b1)) => (b0 as usize, b1 as usize),
                _ => break,
            };
            let len = (b0 >> (8 - LZJB_MATCH_BITS)) + LZJB_MATCH_MIN;
            let distance = ((b0 << 8) | b1) & LZJB_OFFSET_MASK;
            if distance == 0 || distance > out.len() {
                return Err(ZfsError::Invalid(format!(
                    "lzjb back reference {} at output offset {}",
                    distance,
                    out.len()
                )));
            }
            let start = out.len() - distance;
            for i in 0..len.min(size - out.len()) {
                let b = out[start + i];
                out.push(b);
            }
        } else {
            match src.next() {
                Some(b) => out.push(b),
                None => break,
            }
        }
    }
    Ok(out)
}

/// Zero run-length encoding: a length byte below `n` copies literals, above
/// it emits zeros.
pub fn decompress_zle(input: &[u8], size: usize, n: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size);
    let mut pos = 0;
    while pos < input.len() && out.len() < size {
        let len = 1 + input[pos] as usize;
        pos += 1;
        if len <= n {
            let literal = input.get(pos..pos + len).ok_or_else(|| {
                ZfsError::Invalid(format!("zle literal run overruns input at {}", pos))
            })?;
            out.extend_from_slice(literal);
            pos += len;
        } else {
            out.resize(out.len() + len - n, 0);
        }
    }
    out.truncate(size);
    Ok(out)
}
