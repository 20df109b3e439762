//! Binary-to-text codec used to carry file bodies inside text responses.
//!
//! Every 3 input bytes become 4 symbols from `A-Z a-z 0-9 + /`; the final
//! group is padded with `=` so the output length is always a multiple of 4.

use thiserror::Error;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
const PAD: u8 = b'=';
const INVALID: u8 = 0xFF;

const DECODE_TABLE: [u8; 256] = build_decode_table();

const fn build_decode_table() -> [u8; 256] {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < ALPHABET.len() {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A byte outside the alphabet, after whitespace was removed.
    #[error("invalid symbol {symbol:#04x} at offset {offset}")]
    InvalidSymbol { symbol: u8, offset: usize },
    /// `=` somewhere other than the last two positions.
    #[error("misplaced padding at offset {offset}")]
    MisplacedPadding { offset: usize },
}

/// Length of the text produced for `len` input bytes.
pub fn encoded_len(len: usize) -> usize {
    len.div_ceil(3) * 4
}

pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(encoded_len(data.len()));
    for chunk in data.chunks(3) {
        let a = chunk[0] as u32;
        let b = chunk.get(1).copied().unwrap_or(0) as u32;
        let c = chunk.get(2).copied().unwrap_or(0) as u32;
        let triple = (a << 16) | (b << 8) | c;

        out.push(ALPHABET[(triple >> 18) as usize & 0x3F] as char);
        out.push(ALPHABET[(triple >> 12) as usize & 0x3F] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(triple >> 6) as usize & 0x3F] as char
        } else {
            PAD as char
        });
        out.push(if chunk.len() > 2 {
            ALPHABET[triple as usize & 0x3F] as char
        } else {
            PAD as char
        });
    }
    out
}

/// Decodes `text`, ignoring any ASCII whitespace.
///
/// Output length is `floor(len * 3 / 4)` minus the number of trailing `=`
/// (at most two). A trailing group shorter than 4 symbols is treated as if
/// padded with zero-valued placeholders.
pub fn decode(text: impl AsRef<[u8]>) -> Result<Vec<u8>, CodecError> {
    let cleaned: Vec<u8> = text
        .as_ref()
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    let padding = cleaned.iter().rev().take(2).take_while(|&&b| b == PAD).count();
    let symbols = cleaned.len() - padding;
    if let Some(offset) = cleaned[..symbols].iter().position(|&b| b == PAD) {
        return Err(CodecError::MisplacedPadding { offset });
    }

    let out_len = (cleaned.len() * 3 / 4).saturating_sub(padding);
    let mut out = Vec::with_capacity(out_len);

    for (group_index, group) in cleaned.chunks(4).enumerate() {
        let mut sextets = [0u32; 4];
        for (k, &symbol) in group.iter().enumerate() {
            if symbol == PAD {
                continue;
            }
            let value = DECODE_TABLE[symbol as usize];
            if value == INVALID {
                return Err(CodecError::InvalidSymbol {
                    symbol,
                    offset: group_index * 4 + k,
                });
            }
            sextets[k] = value as u32;
        }
        let triple = (sextets[0] << 18) | (sextets[1] << 12) | (sextets[2] << 6) | sextets[3];
        for shift in [16, 8, 0] {
            if out.len() < out_len {
                out.push((triple >> shift) as u8);
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    #[test]
    fn decodes_man() {
        assert_eq!(decode("TWFu").unwrap(), vec![77, 97, 110]);
    }

    #[test]
    fn padding_follows_length_mod_three() {
        assert_eq!(encode(b"Man"), "TWFu");
        assert_eq!(encode(b"Ma"), "TWE=");
        assert_eq!(encode(b"M"), "TQ==");
        assert_eq!(encode(b""), "");
    }

    #[test]
    fn encoded_length_is_four_per_started_triple() {
        for len in 0..40 {
            let data = vec![0xA5u8; len];
            let text = encode(&data);
            assert_eq!(text.len(), 4 * len.div_ceil(3));
            assert_eq!(text.len(), encoded_len(len));
            let pads = text.bytes().filter(|&b| b == b'=').count();
            let expected = match len % 3 {
                0 => 0,
                1 => 2,
                _ => 1,
            };
            assert_eq!(pads, expected, "len {len}");
        }
    }

    #[test]
    fn round_trips_all_byte_values() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for len in [0, 1, 2, 3, 4, 5, 255, 256, 257, 999, 1000] {
            let slice = &data[..len];
            assert_eq!(decode(encode(slice)).unwrap(), slice);
        }
    }

    #[test]
    fn matches_standard_engine() {
        let data: Vec<u8> = (0..200u32).map(|i| (i * 31 % 251) as u8).collect();
        for len in 0..data.len() {
            let ours = encode(&data[..len]);
            assert_eq!(ours, STANDARD.encode(&data[..len]));
            assert_eq!(decode(&ours).unwrap(), STANDARD.decode(&ours).unwrap());
        }
    }

    #[test]
    fn ignores_whitespace() {
        assert_eq!(decode("TW\r\nFu\n").unwrap(), b"Man");
        assert_eq!(decode(" T Q = = ").unwrap(), b"M");
    }

    #[test]
    fn empty_input_decodes_to_nothing() {
        assert!(decode("").unwrap().is_empty());
        assert!(decode(" \r\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_symbols_outside_alphabet() {
        assert_eq!(
            decode("TW-u"),
            Err(CodecError::InvalidSymbol {
                symbol: b'-',
                offset: 2
            })
        );
        assert!(decode("TWFu\0AAA").is_err());
        assert!(decode("TW\x01u").is_err());
    }

    #[test]
    fn rejects_padding_before_the_end() {
        assert_eq!(
            decode("TQ==TWFu"),
            Err(CodecError::MisplacedPadding { offset: 2 })
        );
        assert!(decode("T===").is_err());
    }
}
