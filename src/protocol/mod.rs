//! MnistProt wire protocol
//!
//! Every message is a single FlatBuffers `Commands` envelope whose `cmd`
//! tag selects which payload slot is populated:
//!
//! ```text
//! table Commands        { cmd:ubyte; stats:Stats; input:InferenceInput; ouput:InferenceOutput }
//! table Stats           { version:ubyte; freq:uint; mode:byte }
//! table InferenceInput  { digit:[float] }
//! table InferenceOutput { output_f:[float]; output_n:uint; timer_ms:float }
//! ```
//!
//! Payload shapes are fixed per tag, so every tag has exactly one encoded
//! size (see [`Command::frame_len`]). Digit samples are 8-bit pixels but
//! travel as float32, which is what existing clients send.
//!
//! Each sample must be a whole number in `0..=255`. Clients that send
//! normalised floats (e.g. `0.5`) are rejected with
//! [`DecodeError::SampleOutOfRange`], a compatibility break for them.

mod flatbuf;

use thiserror::Error;

use flatbuf::{Builder, Table};

/// Pixels in one flattened 28x28 digit.
pub const DIGIT_LEN: usize = 784;

/// Scores in one inference result, one per digit class.
pub const CLASS_COUNT: usize = 10;

/// Encoded size of an `INFERENCE_INPUT` envelope.
pub const REQUEST_FRAME_LEN: usize = 3180;

/// Encoded size of an `INFERENCE_OUTPUT` envelope.
pub const RESPONSE_FRAME_LEN: usize = 96;

/// Encoded size of a `STATS` envelope.
pub const STATS_FRAME_LEN: usize = 44;

/// Encoded size of a `GET_STATS` envelope (the smallest envelope).
pub const GET_STATS_FRAME_LEN: usize = 20;

// Commands slots
const SLOT_CMD: usize = 0;
const SLOT_STATS: usize = 1;
const SLOT_INPUT: usize = 2;
const SLOT_OUTPUT: usize = 3;
const COMMANDS_SLOTS: usize = 4;

// Stats slots
const SLOT_VERSION: usize = 0;
const SLOT_FREQ: usize = 1;
const SLOT_MODE: usize = 2;
const STATS_SLOTS: usize = 3;

// InferenceInput slots
const SLOT_DIGIT: usize = 0;
const INPUT_SLOTS: usize = 1;

// InferenceOutput slots
const SLOT_OUTPUT_F: usize = 0;
const SLOT_OUTPUT_N: usize = 1;
const SLOT_TIMER_MS: usize = 2;
const OUTPUT_SLOTS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Message truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unknown command tag: {0}")]
    UnknownTag(u8),

    #[error("Length mismatch for {field}: expected {expected}, got {actual}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Digit sample {index} out of range: {value}")]
    SampleOutOfRange { index: usize, value: f32 },

    #[error("Malformed buffer: {0}")]
    Malformed(String),
}

/// Envelope tag. Closed set: anything else on the wire is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    GetStats = 0,
    Stats = 1,
    InferenceInput = 2,
    InferenceOutput = 3,
}

impl Command {
    /// Exact encoded size of an envelope carrying this tag.
    pub fn frame_len(self) -> usize {
        match self {
            Command::GetStats => GET_STATS_FRAME_LEN,
            Command::Stats => STATS_FRAME_LEN,
            Command::InferenceInput => REQUEST_FRAME_LEN,
            Command::InferenceOutput => RESPONSE_FRAME_LEN,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::GetStats => "CMD_GET_STATS",
            Command::Stats => "CMD_STATS",
            Command::InferenceInput => "CMD_INFERENCE_INPUT",
            Command::InferenceOutput => "CMD_INFERENCE_OUTPUT",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = DecodeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Command::GetStats),
            1 => Ok(Command::Stats),
            2 => Ok(Command::InferenceInput),
            3 => Ok(Command::InferenceOutput),
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

/// Device statistics payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub version: u8,
    pub freq: u32,
    pub mode: i8,
}

/// One flattened 28x28 grayscale digit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceInput {
    pub digit: [u8; DIGIT_LEN],
}

impl InferenceInput {
    pub fn new(digit: [u8; DIGIT_LEN]) -> Self {
        Self { digit }
    }

    /// Build from a slice, rejecting anything that is not exactly
    /// `DIGIT_LEN` samples long.
    pub fn from_slice(samples: &[u8]) -> Result<Self, DecodeError> {
        let digit: [u8; DIGIT_LEN] =
            samples.try_into().map_err(|_| DecodeError::LengthMismatch {
                field: "digit",
                expected: DIGIT_LEN,
                actual: samples.len(),
            })?;
        Ok(Self { digit })
    }
}

/// Class scores plus the time the backend spent producing them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceOutput {
    pub scores: [f32; CLASS_COUNT],
    pub timer_ms: f32,
}

impl InferenceOutput {
    /// Index of the highest score.
    pub fn predicted_class(&self) -> usize {
        argmax(&self.scores)
    }
}

pub(crate) fn argmax(scores: &[f32]) -> usize {
    scores
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_score), (i, &s)| {
            if s > best_score {
                (i, s)
            } else {
                (best, best_score)
            }
        })
        .0
}

/// The wire message: one tag, at most one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    GetStats,
    Stats(Stats),
    InferenceInput(InferenceInput),
    InferenceOutput(InferenceOutput),
}

impl Envelope {
    pub fn command(&self) -> Command {
        match self {
            Envelope::GetStats => Command::GetStats,
            Envelope::Stats(_) => Command::Stats,
            Envelope::InferenceInput(_) => Command::InferenceInput,
            Envelope::InferenceOutput(_) => Command::InferenceOutput,
        }
    }

    /// Encode to a finished FlatBuffers buffer of exactly
    /// `self.command().frame_len()` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let command = self.command();
        let mut b = Builder::with_capacity(command.frame_len());

        let payload = match self {
            Envelope::GetStats => None,
            Envelope::Stats(stats) => {
                b.start_table(STATS_SLOTS);
                b.add_u32(SLOT_FREQ, stats.freq);
                b.add_i8(SLOT_MODE, stats.mode);
                b.add_u8(SLOT_VERSION, stats.version);
                Some((SLOT_STATS, b.end_table()))
            }
            Envelope::InferenceInput(input) => {
                let samples: Vec<f32> = input.digit.iter().map(|&px| f32::from(px)).collect();
                let digit = b.create_f32_vector(&samples);
                b.start_table(INPUT_SLOTS);
                b.add_offset(SLOT_DIGIT, digit);
                Some((SLOT_INPUT, b.end_table()))
            }
            Envelope::InferenceOutput(output) => {
                let scores = b.create_f32_vector(&output.scores);
                b.start_table(OUTPUT_SLOTS);
                b.add_f32(SLOT_TIMER_MS, output.timer_ms);
                b.add_u32(SLOT_OUTPUT_N, CLASS_COUNT as u32);
                b.add_offset(SLOT_OUTPUT_F, scores);
                Some((SLOT_OUTPUT, b.end_table()))
            }
        };

        b.start_table(COMMANDS_SLOTS);
        b.add_u8(SLOT_CMD, command as u8);
        if let Some((slot, table)) = payload {
            b.add_offset(slot, table);
        }
        let root = b.end_table();
        let bytes = b.finish(root);
        debug_assert_eq!(bytes.len(), command.frame_len());
        bytes
    }

    /// Decode one envelope.
    ///
    /// Fails on buffers shorter than the size fixed for their tag, on tags
    /// outside the closed set, and on payloads whose lengths disagree with
    /// the schema constants.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < GET_STATS_FRAME_LEN {
            return Err(DecodeError::Truncated {
                expected: GET_STATS_FRAME_LEN,
                actual: bytes.len(),
            });
        }

        let root = Table::root(bytes)?;
        let command = Command::try_from(root.get_u8(SLOT_CMD)?)?;
        if bytes.len() < command.frame_len() {
            return Err(DecodeError::Truncated {
                expected: command.frame_len(),
                actual: bytes.len(),
            });
        }

        match command {
            Command::GetStats => Ok(Envelope::GetStats),
            Command::Stats => {
                let stats = match root.get_table(SLOT_STATS)? {
                    Some(t) => Stats {
                        version: t.get_u8(SLOT_VERSION)?,
                        freq: t.get_u32(SLOT_FREQ)?.unwrap_or(0),
                        mode: t.get_i8(SLOT_MODE)?,
                    },
                    None => Stats::default(),
                };
                Ok(Envelope::Stats(stats))
            }
            Command::InferenceInput => {
                let samples = match root.get_table(SLOT_INPUT)? {
                    Some(t) => t.get_f32_vector(SLOT_DIGIT)?,
                    None => Vec::new(),
                };
                Ok(Envelope::InferenceInput(decode_digit(&samples)?))
            }
            Command::InferenceOutput => {
                let (scores, count, timer_ms) = match root.get_table(SLOT_OUTPUT)? {
                    Some(t) => (
                        t.get_f32_vector(SLOT_OUTPUT_F)?,
                        t.get_u32(SLOT_OUTPUT_N)?,
                        t.get_f32(SLOT_TIMER_MS)?,
                    ),
                    None => (Vec::new(), None, 0.0),
                };
                if let Some(n) = count {
                    if n as usize != CLASS_COUNT {
                        return Err(DecodeError::LengthMismatch {
                            field: "output_n",
                            expected: CLASS_COUNT,
                            actual: n as usize,
                        });
                    }
                }
                let scores: [f32; CLASS_COUNT] =
                    scores.as_slice().try_into().map_err(|_| DecodeError::LengthMismatch {
                        field: "output_f",
                        expected: CLASS_COUNT,
                        actual: scores.len(),
                    })?;
                Ok(Envelope::InferenceOutput(InferenceOutput { scores, timer_ms }))
            }
        }
    }
}

fn decode_digit(samples: &[f32]) -> Result<InferenceInput, DecodeError> {
    if samples.len() != DIGIT_LEN {
        return Err(DecodeError::LengthMismatch {
            field: "digit",
            expected: DIGIT_LEN,
            actual: samples.len(),
        });
    }
    let mut digit = [0u8; DIGIT_LEN];
    for (index, (&value, px)) in samples.iter().zip(digit.iter_mut()).enumerate() {
        if !value.is_finite() || value.fract() != 0.0 || !(0.0..=255.0).contains(&value) {
            return Err(DecodeError::SampleOutOfRange { index, value });
        }
        *px = value as u8;
    }
    Ok(InferenceInput { digit })
}

/// Encode an `INFERENCE_INPUT` envelope around arbitrary float samples,
/// bypassing the `[u8; DIGIT_LEN]` domain type.
#[cfg(test)]
pub(crate) fn encode_raw_input(samples: &[f32]) -> Vec<u8> {
    let mut b = Builder::with_capacity(REQUEST_FRAME_LEN);
    let digit = b.create_f32_vector(samples);
    b.start_table(INPUT_SLOTS);
    b.add_offset(SLOT_DIGIT, digit);
    let input = b.end_table();

    b.start_table(COMMANDS_SLOTS);
    b.add_u8(SLOT_CMD, Command::InferenceInput as u8);
    b.add_offset(SLOT_INPUT, input);
    let root = b.end_table();
    b.finish(root)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn finite() -> impl Strategy<Value = f32> {
        -1.0e6f32..1.0e6f32
    }

    proptest! {
        #[test]
        fn prop_input_round_trip(digit in proptest::collection::vec(any::<u8>(), DIGIT_LEN)) {
            let env = Envelope::InferenceInput(InferenceInput::from_slice(&digit).unwrap());
            let bytes = env.encode();
            prop_assert_eq!(bytes.len(), REQUEST_FRAME_LEN);
            prop_assert_eq!(Envelope::decode(&bytes).unwrap(), env);
        }

        #[test]
        fn prop_output_round_trip(
            scores in proptest::array::uniform10(finite()),
            timer_ms in 0.0f32..1.0e5f32,
        ) {
            let env = Envelope::InferenceOutput(InferenceOutput { scores, timer_ms });
            prop_assert_eq!(Envelope::decode(&env.encode()).unwrap(), env);
        }

        #[test]
        fn prop_stats_round_trip(version in any::<u8>(), freq in any::<u32>(), mode in any::<i8>()) {
            let env = Envelope::Stats(Stats { version, freq, mode });
            prop_assert_eq!(Envelope::decode(&env.encode()).unwrap(), env);
        }

        #[test]
        fn prop_prefix_never_decodes(cut in 0usize..REQUEST_FRAME_LEN) {
            let bytes = Envelope::InferenceInput(InferenceInput::new([7; DIGIT_LEN])).encode();
            prop_assert!(Envelope::decode(&bytes[..cut]).is_err());
        }
    }
}
