//!
//! Name/value lists.
//!
//! Vdev labels and packed nvlist objects use the XDR (big-endian) encoding;
//! pool history records use the native little-endian one. Both decode into
//! the same ordered [`NvList`].
//!
use std::fmt;

use nom::bytes::complete::{take, take_until};
use nom::error::ErrorKind;
use nom::multi::count;
use nom::number::complete::{be_i32, be_i64, be_u32, be_u64, le_i16, le_i32, le_u16, le_u32, le_u64, le_u8};
use nom::sequence::tuple;
use nom::IResult;
use tracing::warn;

use crate::{Result, ZfsError};

pub const NV_ENCODE_NATIVE: u8 = 0;
pub const NV_ENCODE_XDR: u8 = 1;
const NV_LITTLE_ENDIAN: u8 = 1;
const XDR_HEADER: u32 = 0x0101_0000;
const MAX_DEPTH: usize = 32;
const NATIVE_PAIR_HEADER: usize = 16;
const NATIVE_NVLIST_SIZE: usize = 24;

const DATA_TYPE_BOOLEAN: u32 = 1;
const DATA_TYPE_BYTE: u32 = 2;
const DATA_TYPE_INT16: u32 = 3;
const DATA_TYPE_UINT16: u32 = 4;
const DATA_TYPE_INT32: u32 = 5;
const DATA_TYPE_UINT32: u32 = 6;
const DATA_TYPE_INT64: u32 = 7;
const DATA_TYPE_UINT64: u32 = 8;
const DATA_TYPE_STRING: u32 = 9;
const DATA_TYPE_UINT64_ARRAY: u32 = 16;
const DATA_TYPE_STRING_ARRAY: u32 = 17;
const DATA_TYPE_HRTIME: u32 = 18;
const DATA_TYPE_NVLIST: u32 = 19;
const DATA_TYPE_NVLIST_ARRAY: u32 = 20;
const DATA_TYPE_BOOLEAN_VALUE: u32 = 21;
const DATA_TYPE_INT8: u32 = 22;
const DATA_TYPE_UINT8: u32 = 23;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NvValue {
    /// Presence-only flag.
    Boolean,
    BooleanValue(bool),
    I64(i64),
    U64(u64),
    String(String),
    U64Array(Vec<u64>),
    StringArray(Vec<String>),
    NvList(NvList),
    NvListArray(Vec<NvList>),
}

impl fmt::Display for NvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvValue::Boolean => write!(f, "true"),
            NvValue::BooleanValue(b) => write!(f, "{}", b),
            NvValue::I64(v) => write!(f, "{}", v),
            NvValue::U64(v) => write!(f, "{}", v),
            NvValue::String(s) => write!(f, "{:?}", s),
            NvValue::U64Array(v) => write!(f, "{:?}", v),
            NvValue::StringArray(v) => write!(f, "{:?}", v),
            NvValue::NvList(l) => write!(f, "{}", l),
            NvValue::NvListArray(lists) => {
                write!(f, "[")?;
                for (i, l) in lists.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", l)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Ordered list of name/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NvList {
    pairs: Vec<(String, NvValue)>,
}

impl fmt::Display for NvList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        write!(f, "}}")
    }
}

impl NvList {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&mut self, name: impl Into<String>, value: NvValue) {
        self.pairs.push((name.into(), value));
    }
    pub fn len(&self) -> usize {
        self.pairs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NvValue)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v))
    }
    pub fn get(&self, name: &str) -> Option<&NvValue> {
        self.pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            NvValue::U64(v) => Some(*v),
            NvValue::I64(v) => Some(*v as u64),
            _ => None,
        }
    }
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            NvValue::String(s) => Some(s),
            _ => None,
        }
    }
    pub fn get_list(&self, name: &str) -> Option<&NvList> {
        match self.get(name)? {
            NvValue::NvList(l) => Some(l),
            _ => None,
        }
    }
    pub fn get_list_array(&self, name: &str) -> Option<&[NvList]> {
        match self.get(name)? {
            NvValue::NvListArray(l) => Some(l),
            _ => None,
        }
    }

    /// Decodes an XDR list, with or without the 4-byte stream header.
    pub fn decode_xdr(input: &[u8]) -> Result<Self> {
        let (_, header) = xdr_header(input)?;
        let input = if header == XDR_HEADER { &input[4..] } else { input };
        let (_, list) = xdr_nvlist(input, 0)?;
        Ok(list)
    }

    /// Decodes a packed list, dispatching on the encoding in its stream header.
    pub fn unpack(input: &[u8]) -> Result<Self> {
        let (body, (encoding, endian)) = packed_header(input)?;
        match encoding {
            NV_ENCODE_XDR => {
                let (_, list) = xdr_nvlist(body, 0)?;
                Ok(list)
            }
            NV_ENCODE_NATIVE if endian == NV_LITTLE_ENDIAN => {
                let (_, list) = native_nvlist(body, 0)?;
                Ok(list)
            }
            NV_ENCODE_NATIVE => Err(ZfsError::UnsupportedFeature(
                "big-endian native nvlist".to_owned(),
            )),
            other => Err(ZfsError::Invalid(format!("nvlist encoding {}", other))),
        }
    }
}

fn unknown_type(input: &[u8], kind: u32) -> nom::Err<(&[u8], ErrorKind)> {
    warn!(kind, "unknown nvpair data type");
    nom::Err::Failure((input, ErrorKind::Switch))
}

fn too_deep(input: &[u8]) -> nom::Err<(&[u8], ErrorKind)> {
    nom::Err::Failure((input, ErrorKind::TooLarge))
}

fn pad4(len: usize) -> usize {
    (4 - len % 4) % 4
}

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

fn xdr_header(input: &[u8]) -> IResult<&[u8], u32> {
    be_u32(input)
}

/// Encoding and byte order of a packed list; two reserved bytes follow.
fn packed_header(input: &[u8]) -> IResult<&[u8], (u8, u8)> {
    let (rest, (encoding, endian, _reserved)) = tuple((le_u8, le_u8, le_u16))(input)?;
    Ok((rest, (encoding, endian)))
}

fn xdr_string(input: &[u8]) -> IResult<&[u8], String> {
    let (input, len) = be_u32(input)?;
    let (input, bytes) = take(len as usize)(input)?;
    let (input, _) = take(pad4(len as usize))(input)?;
    Ok((input, String::from_utf8_lossy(bytes).into_owned()))
}

fn xdr_nvlist(input: &[u8], depth: usize) -> IResult<&[u8], NvList> {
    if depth > MAX_DEPTH {
        return Err(too_deep(input));
    }
    let (mut input, (_version, _flag)) = tuple((be_u32, be_u32))(input)?;
    let mut list = NvList::new();
    loop {
        let (rest, (encoded_size, _decoded_size)) = tuple((be_u32, be_u32))(input)?;
        if encoded_size == 0 {
            return Ok((rest, list));
        }
        let (rest, (name, kind, nelem)) = tuple((xdr_string, be_u32, be_u32))(rest)?;
        let (rest, value) = xdr_value(rest, kind, nelem as usize, depth)?;
        list.pairs.push((name, value));
        input = rest;
    }
}

fn xdr_value(input: &[u8], kind: u32, nelem: usize, depth: usize) -> IResult<&[u8], NvValue> {
    match kind {
        DATA_TYPE_BOOLEAN => Ok((input, NvValue::Boolean)),
        DATA_TYPE_BOOLEAN_VALUE => {
            let (input, v) = be_u32(input)?;
            Ok((input, NvValue::BooleanValue(v != 0)))
        }
        // XDR widens every small integer to four bytes
        DATA_TYPE_BYTE | DATA_TYPE_UINT8 | DATA_TYPE_UINT16 | DATA_TYPE_UINT32 => {
            let (input, v) = be_u32(input)?;
            Ok((input, NvValue::U64(u64::from(v))))
        }
        DATA_TYPE_INT8 | DATA_TYPE_INT16 | DATA_TYPE_INT32 => {
            let (input, v) = be_i32(input)?;
            Ok((input, NvValue::I64(i64::from(v))))
        }
        DATA_TYPE_INT64 | DATA_TYPE_HRTIME => {
            let (input, v) = be_i64(input)?;
            Ok((input, NvValue::I64(v)))
        }
        DATA_TYPE_UINT64 => {
            let (input, v) = be_u64(input)?;
            Ok((input, NvValue::U64(v)))
        }
        DATA_TYPE_STRING => {
            let (input, s) = xdr_string(input)?;
            Ok((input, NvValue::String(s)))
        }
        DATA_TYPE_UINT64_ARRAY => {
            let (input, v) = count(be_u64, nelem)(input)?;
            Ok((input, NvValue::U64Array(v)))
        }
        DATA_TYPE_STRING_ARRAY => {
            let (input, v) = count(xdr_string, nelem)(input)?;
            Ok((input, NvValue::StringArray(v)))
        }
        DATA_TYPE_NVLIST => {
            let (input, l) = xdr_nvlist(input, depth + 1)?;
            Ok((input, NvValue::NvList(l)))
        }
        DATA_TYPE_NVLIST_ARRAY => {
            let (input, l) = count(|i| xdr_nvlist(i, depth + 1), nelem)(input)?;
            Ok((input, NvValue::NvListArray(l)))
        }
        other => Err(unknown_type(input, other)),
    }
}

fn native_nvlist(input: &[u8], depth: usize) -> IResult<&[u8], NvList> {
    if depth > MAX_DEPTH {
        return Err(too_deep(input));
    }
    let (mut input, (_version, _flag)) = tuple((le_i32, le_u32))(input)?;
    let mut list = NvList::new();
    loop {
        let (_, size) = le_i32(input)?;
        if size <= 0 {
            let (rest, _) = le_i32(input)?;
            return Ok((rest, list));
        }
        let (rest, pair) = take(size as usize)(input)?;
        let (_, (_size, name_sz, _reserve, nelem, kind)) =
            tuple((le_i32, le_i16, le_i16, le_i32, le_u32))(pair)?;
        let name_end = NATIVE_PAIR_HEADER + (name_sz.max(1) as usize);
        let name = pair
            .get(NATIVE_PAIR_HEADER..name_end - 1)
            .ok_or(nom::Err::Error((pair, ErrorKind::Eof)))?;
        let value = pair.get(align8(name_end)..).unwrap_or(&[]);
        let nelem = nelem.max(0) as usize;
        let (rest, value) = match kind {
            DATA_TYPE_NVLIST => {
                let (rest, l) = native_nvlist(rest, depth + 1)?;
                (rest, NvValue::NvList(l))
            }
            DATA_TYPE_NVLIST_ARRAY => {
                let (rest, l) = count(|i| native_nvlist(i, depth + 1), nelem)(rest)?;
                (rest, NvValue::NvListArray(l))
            }
            kind => (rest, native_value(value, kind, nelem)?.1),
        };
        list.pairs
            .push((String::from_utf8_lossy(name).into_owned(), value));
        input = rest;
    }
}

fn native_cstring(input: &[u8]) -> IResult<&[u8], String> {
    let (input, bytes) = take_until(&b"\0"[..])(input)?;
    let (input, _) = take(1usize)(input)?;
    Ok((input, String::from_utf8_lossy(bytes).into_owned()))
}

fn native_value(input: &[u8], kind: u32, nelem: usize) -> IResult<&[u8], NvValue> {
    match kind {
        DATA_TYPE_BOOLEAN => Ok((input, NvValue::Boolean)),
        DATA_TYPE_BOOLEAN_VALUE => {
            let (input, v) = le_i32(input)?;
            Ok((input, NvValue::BooleanValue(v != 0)))
        }
        DATA_TYPE_BYTE | DATA_TYPE_UINT8 => {
            let (input, v) = le_u8(input)?;
            Ok((input, NvValue::U64(u64::from(v))))
        }
        DATA_TYPE_INT8 => {
            let (input, v) = le_u8(input)?;
            Ok((input, NvValue::I64(i64::from(v as i8))))
        }
        DATA_TYPE_UINT16 => {
            let (input, v) = le_u16(input)?;
            Ok((input, NvValue::U64(u64::from(v))))
        }
        DATA_TYPE_INT16 => {
            let (input, v) = le_i16(input)?;
            Ok((input, NvValue::I64(i64::from(v))))
        }
        DATA_TYPE_UINT32 => {
            let (input, v) = le_u32(input)?;
            Ok((input, NvValue::U64(u64::from(v))))
        }
        DATA_TYPE_INT32 => {
            let (input, v) = le_i32(input)?;
            Ok((input, NvValue::I64(i64::from(v))))
        }
        DATA_TYPE_INT64 | DATA_TYPE_HRTIME => {
            let (input, v) = le_u64(input)?;
            Ok((input, NvValue::I64(v as i64)))
        }
        DATA_TYPE_UINT64 => {
            let (input, v) = le_u64(input)?;
            Ok((input, NvValue::U64(v)))
        }
        DATA_TYPE_STRING => {
            let (input, s) = native_cstring(input)?;
            Ok((input, NvValue::String(s)))
        }
        DATA_TYPE_UINT64_ARRAY => {
            let (input, v) = count(le_u64, nelem)(input)?;
            Ok((input, NvValue::U64Array(v)))
        }
        DATA_TYPE_STRING_ARRAY => {
            // pointer slots precede the strings
            let (input, _) = take(nelem * 8)(input)?;
            let (input, v) = count(native_cstring, nelem)(input)?;
            Ok((input, NvValue::StringArray(v)))
        }
        other => Err(unknown_type(input, other)),
    }
}
