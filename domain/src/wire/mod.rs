//! Wire encoding of queue payloads.

pub mod envelope;

pub use envelope::{
    DecodedPrompt, decode_cancel, decode_fragment, decode_prompt, encode_cancel, encode_fragment,
    encode_prompt,
};
