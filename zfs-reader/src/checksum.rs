use nom::multi::fold_many0;
use nom::number::complete::{be_u64, le_u32, le_u64};
use nom::sequence::{pair, tuple};
use nom::IResult;
use sha2::{Digest, Sha256};

use crate::spa::{Checksum, ChecksumType};
use crate::{Result, ZfsError};

#[derive(Debug, Clone, Default)]
pub struct Fletcher4 {
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub d: u64,
}

impl Fletcher4 {
    pub fn new() -> Self {
        Self::default()
    }
    fn input(&mut self, data: u32) {
        self.a = self.a.wrapping_add(data as u64);
        self.b = self.b.wrapping_add(self.a);
        self.c = self.c.wrapping_add(self.b);
        self.d = self.d.wrapping_add(self.c);
    }
    /// Trailing bytes short of a whole word are left unconsumed.
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        fold_many0(le_u32, Self::new(), |mut cksum, input| {
            cksum.input(input);
            cksum
        })(input)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Fletcher2 {
    pub a0: u64,
    pub a1: u64,
    pub b0: u64,
    pub b1: u64,
}

impl Fletcher2 {
    pub fn new() -> Self {
        Self::default()
    }
    fn input(&mut self, data0: u64, data1: u64) {
        self.a0 = self.a0.wrapping_add(data0);
        self.a1 = self.a1.wrapping_add(data1);
        self.b0 = self.b0.wrapping_add(self.a0);
        self.b1 = self.b1.wrapping_add(self.a1);
    }
    /// Trailing bytes short of a whole pair are left unconsumed.
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        fold_many0(
            pair(le_u64, le_u64),
            Self::new(),
            |mut cksum, (input0, input1)| {
                cksum.input(input0, input1);
                cksum
            },
        )(input)
    }
}

fn digest_words(input: &[u8]) -> IResult<&[u8], (u64, u64, u64, u64)> {
    tuple((be_u64, be_u64, be_u64, be_u64))(input)
}

/// SHA-256 digest as four big-endian words.
pub fn sha256(data: &[u8]) -> Result<Checksum> {
    let digest = Sha256::digest(data);
    let (_, (a, b, c, d)) = digest_words(digest.as_slice())?;
    Ok(Checksum {
        checksum: [a, b, c, d],
    })
}

/// Computes `data`'s checksum, `None` for algorithms that always validate.
pub fn compute(kind: ChecksumType, data: &[u8]) -> Result<Option<Checksum>> {
    match kind {
        ChecksumType::Off | ChecksumType::NoParity => Ok(None),
        ChecksumType::On | ChecksumType::Fletcher4 | ChecksumType::ZILog2 => {
            let (_, f) = Fletcher4::parse(data)?;
            Ok(Some(f.into()))
        }
        ChecksumType::ZILog | ChecksumType::Fletcher2 => {
            let (_, f) = Fletcher2::parse(data)?;
            Ok(Some(f.into()))
        }
        ChecksumType::SHA256 => sha256(data).map(Some),
        other => Err(ZfsError::UnsupportedFeature(format!(
            "checksum algorithm {:?}",
            other
        ))),
    }
}

/// Verifies `data` against `expected`. On mismatch the computed value is returned.
pub fn verify(
    kind: ChecksumType,
    data: &[u8],
    expected: &Checksum,
) -> Result<std::result::Result<(), Checksum>> {
    Ok(match compute(kind, data)? {
        Some(actual) if actual != *expected => Err(actual),
        _ => Ok(()),
    })
}
