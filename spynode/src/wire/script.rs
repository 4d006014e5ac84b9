//! Script parsing for relevance checks.
//!
//! Only push data is interpreted. Other opcodes are reported but never executed.

use std::borrow::Cow;

use crate::wire::hashes::Hash20;

pub const OP_FALSE: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;

/// Envelope protocol id pushed after the `OP_RETURN`.
const ENVELOPE_ID: [u8; 2] = [0xbd, 0x00];
const PROTOCOL_ID: &[u8] = b"tokenized";
const TEST_PROTOCOL_ID: &[u8] = b"test.tokenized";

/// Protobuf field number of the envelope's payload identifier.
const ENVELOPE_IDENTIFIER_FIELD: u64 = 3;

/// Action code of a contract formation.
pub const CONTRACT_FORMATION: &[u8] = b"C2";
/// Action code of an asset creation.
pub const ASSET_CREATION: &[u8] = b"A2";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction<'a> {
    /// Data pushed onto the stack, including small integer pushes.
    PushBytes(Cow<'a, [u8]>),
    /// Any non-push opcode.
    Op(u8),
}

/// A push ran past the end of the script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TruncatedPush;

/// Iterator over the instructions of a script.
pub struct Instructions<'a> {
    script: &'a [u8],
    pos: usize,
}

pub fn instructions(script: &[u8]) -> Instructions<'_> {
    Instructions {
        script,
        pos: 0,
    }
}

impl<'a> Instructions<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], TruncatedPush> {
        let end = self.pos.checked_add(len).ok_or(TruncatedPush)?;
        if end > self.script.len() {
            return Err(TruncatedPush);
        }
        let data = &self.script[self.pos..end];
        self.pos = end;
        Ok(data)
    }

    fn take_len(&mut self, size: usize) -> Result<usize, TruncatedPush> {
        let bytes = self.take(size)?;
        let mut buf = [0u8; 4];
        buf[..size].copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf) as usize)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, TruncatedPush>;

    fn next(&mut self) -> Option<Self::Item> {
        let opcode = *self.script.get(self.pos)?;
        self.pos += 1;

        let result = match opcode {
            OP_FALSE => Ok(Instruction::PushBytes(Cow::Borrowed(&[][..]))),
            0x01..=0x4b => self.take(opcode as usize).map(|d| Instruction::PushBytes(d.into())),
            OP_PUSHDATA1 => self
                .take_len(1)
                .and_then(|len| self.take(len))
                .map(|d| Instruction::PushBytes(d.into())),
            OP_PUSHDATA2 => self
                .take_len(2)
                .and_then(|len| self.take(len))
                .map(|d| Instruction::PushBytes(d.into())),
            OP_PUSHDATA4 => self
                .take_len(4)
                .and_then(|len| self.take(len))
                .map(|d| Instruction::PushBytes(d.into())),
            OP_1NEGATE => Ok(Instruction::PushBytes(Cow::Owned(vec![0x81]))),
            OP_1..=OP_16 => Ok(Instruction::PushBytes(Cow::Owned(vec![opcode - OP_1 + 1]))),
            op => Ok(Instruction::Op(op)),
        };

        if result.is_err() {
            // Nothing after a truncated push can be interpreted.
            self.pos = self.script.len();
        }
        Some(result)
    }
}

/// The push datas of a script, skipping non-push opcodes and stopping at a truncated push.
pub fn push_datas(script: &[u8]) -> impl Iterator<Item = Cow<'_, [u8]>> {
    instructions(script).map_while(|instruction| instruction.ok()).filter_map(|instruction| {
        match instruction {
            Instruction::PushBytes(data) => Some(data),
            Instruction::Op(_) => None,
        }
    })
}

/// The 20 byte form a push data is matched in.
///
/// 20 byte pushes (public key hashes) are used verbatim, anything else is hashed.
pub fn push_data_hash(data: &[u8]) -> Hash20 {
    match Hash20::from_slice(data) {
        Ok(hash) => hash,
        Err(_) => Hash20::hash(data),
    }
}

/// Returns the action code of a contract envelope script, if the script is one.
pub fn envelope_action_code(script: &[u8], is_test: bool) -> Option<Vec<u8>> {
    let start = match script {
        [OP_RETURN, ..] => 1,
        [OP_FALSE, OP_RETURN, ..] => 2,
        _ => return None,
    };

    let mut pushes = instructions(&script[start..]).map_while(|i| match i {
        Ok(Instruction::PushBytes(data)) => Some(data),
        _ => None,
    });

    if pushes.next()?.as_ref() != ENVELOPE_ID {
        return None;
    }
    let expected = if is_test {
        TEST_PROTOCOL_ID
    } else {
        PROTOCOL_ID
    };
    if pushes.next()?.as_ref() != expected {
        return None;
    }
    let envelope = pushes.next()?;
    protobuf_bytes_field(&envelope, ENVELOPE_IDENTIFIER_FIELD)
}

/// True for the contract wide actions: contract formations and asset creations.
pub fn is_contract_marker(script: &[u8], is_test: bool) -> bool {
    matches!(
        envelope_action_code(script, is_test).as_deref(),
        Some(CONTRACT_FORMATION) | Some(ASSET_CREATION)
    )
}

/// Finds a length delimited field in a protobuf message.
fn protobuf_bytes_field(mut data: &[u8], field: u64) -> Option<Vec<u8>> {
    while !data.is_empty() {
        let key = read_protobuf_varint(&mut data)?;
        let (number, wire_type) = (key >> 3, key & 0x7);
        match wire_type {
            0 => {
                read_protobuf_varint(&mut data)?;
            }
            1 => data = data.get(8..)?,
            2 => {
                let len = read_protobuf_varint(&mut data)? as usize;
                let value = data.get(..len)?;
                if number == field {
                    return Some(value.to_vec());
                }
                data = &data[len..];
            }
            5 => data = data.get(4..)?,
            _ => return None,
        }
    }
    None
}

fn read_protobuf_varint(data: &mut &[u8]) -> Option<u64> {
    let bytes = *data;
    let mut value = 0u64;
    for (i, byte) in bytes.iter().enumerate().take(10) {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            *data = &bytes[i + 1..];
            return Some(value);
        }
    }
    None
}
