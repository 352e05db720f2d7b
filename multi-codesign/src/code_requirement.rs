// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code requirement expressions.

Mach-O signatures carry requirement expressions: binary encoded predicate
trees over the signing identifier, the certificate chain and other
attributes of signed code.

# Binary Encoding

An expression is a sequence of opcodes. An opcode is a big-endian u32 where
the high byte holds flags and the lower 3 bytes hold the opcode value.
Operands follow the opcode. Logical operators are followed by their
sub-expressions. Variable length data is a u32 length and the raw bytes,
padded with NULL bytes to the next 4 byte boundary.

# Representation

Expressions are stored in an arena: a [RequirementExpression] owns a vector
of [RequirementNode] and logical operators refer to their operands by
[NodeId]. Operands are always added before the operator that uses them, so
any node only refers to nodes with a lower id and the tree cannot contain
cycles. Encoded sizes are computed bottom-up before writing, letting the
encoder allocate exactly once.
*/

use {
    crate::{
        embedded_signature::{read_and_validate_blob_header, Blob, CodeSigningMagic},
        error::CodesignError,
    },
    bcder::Oid,
    bytes::Bytes,
    chrono::TimeZone,
    scroll::{IOwrite, Pread},
    std::{
        collections::BTreeMap,
        fmt::{Display, Formatter},
        io::Write,
    },
};

const OPCODE_VALUE_MASK: u32 = 0x00ff_ffff;

/// Maximum nesting depth accepted when decoding.
const MAX_DECODE_DEPTH: usize = 256;

/// Requirement blob `kind` for the expression form.
const REQUIREMENT_KIND_EXPRESSION: u32 = 1;

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Encoded size of length-prefixed data.
fn data_size(data: &[u8]) -> usize {
    4 + padded_len(data.len())
}

fn read_data<'a>(data: &'a [u8], offset: &mut usize) -> Result<&'a [u8], CodesignError> {
    let length = data.gread_with::<u32>(offset, scroll::BE)? as usize;

    let value = data
        .get(*offset..*offset + length)
        .ok_or(CodesignError::Truncated {
            offset: *offset,
            needed: length,
        })?;

    *offset += padded_len(length);

    if *offset > data.len() {
        return Err(CodesignError::RequirementMalformed("data padding is truncated"));
    }

    Ok(value)
}

fn read_string(
    data: &[u8],
    offset: &mut usize,
    what: &'static str,
) -> Result<String, CodesignError> {
    let value = read_data(data, offset)?;

    Ok(std::str::from_utf8(value)
        .map_err(|_| CodesignError::RequirementMalformed(what))?
        .to_string())
}

fn write_data(dest: &mut impl Write, data: &[u8]) -> Result<(), CodesignError> {
    dest.iowrite_with(data.len() as u32, scroll::BE)?;
    dest.write_all(data)?;

    for _ in data.len()..padded_len(data.len()) {
        dest.iowrite(0u8)?;
    }

    Ok(())
}

/// Format a certificate slot's value to human form.
fn format_certificate_slot(slot: i32) -> String {
    match slot {
        -1 => "root".to_string(),
        0 => "leaf".to_string(),
        _ => format!("{}", slot),
    }
}

/// A value operand in a match operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequirementValue {
    String(String),
    Bytes(Vec<u8>),
}

impl From<&[u8]> for RequirementValue {
    fn from(value: &[u8]) -> Self {
        let is_ascii_printable = |c: &u8| -> bool {
            c.is_ascii_alphanumeric() || c.is_ascii_whitespace() || c.is_ascii_punctuation()
        };

        match std::str::from_utf8(value) {
            Ok(s) if value.iter().all(is_ascii_printable) => Self::String(s.to_string()),
            _ => Self::Bytes(value.to_vec()),
        }
    }
}

impl From<&str> for RequirementValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RequirementValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl Display for RequirementValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_fmt(format_args!("\"{}\"", s)),
            Self::Bytes(data) => f.write_fmt(format_args!("H\"{}\"", hex::encode(data))),
        }
    }
}

impl RequirementValue {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::String(s) => s.as_bytes(),
            Self::Bytes(data) => data,
        }
    }
}

/// A predicate applied to a looked-up value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MatchOperation {
    /// `exists`
    Exists,
    /// `= <value>`
    Equal(RequirementValue),
    /// `~ <value>`
    Contains(RequirementValue),
    /// `= <value>*`
    BeginsWith(RequirementValue),
    /// `= *<value>`
    EndsWith(RequirementValue),
    /// `< <value>`
    LessThan(RequirementValue),
    /// `> <value>`
    GreaterThan(RequirementValue),
    /// `<= <value>`
    LessThanEqual(RequirementValue),
    /// `>= <value>`
    GreaterThanEqual(RequirementValue),
    /// `= timestamp "<time>"`
    On(chrono::DateTime<chrono::Utc>),
    /// `< timestamp "<time>"`
    Before(chrono::DateTime<chrono::Utc>),
    /// `> timestamp "<time>"`
    After(chrono::DateTime<chrono::Utc>),
    /// `<= timestamp "<time>"`
    OnOrBefore(chrono::DateTime<chrono::Utc>),
    /// `>= timestamp "<time>"`
    OnOrAfter(chrono::DateTime<chrono::Utc>),
    /// `absent`
    Absent,
}

impl Display for MatchOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exists => f.write_str("exists"),
            Self::Equal(value) => f.write_fmt(format_args!("= {}", value)),
            Self::Contains(value) => f.write_fmt(format_args!("~ {}", value)),
            Self::BeginsWith(value) => f.write_fmt(format_args!("= {}*", value)),
            Self::EndsWith(value) => f.write_fmt(format_args!("= *{}", value)),
            Self::LessThan(value) => f.write_fmt(format_args!("< {}", value)),
            Self::GreaterThan(value) => f.write_fmt(format_args!("> {}", value)),
            Self::LessThanEqual(value) => f.write_fmt(format_args!("<= {}", value)),
            Self::GreaterThanEqual(value) => f.write_fmt(format_args!(">= {}", value)),
            Self::On(t) => f.write_fmt(format_args!("= timestamp \"{}\"", t)),
            Self::Before(t) => f.write_fmt(format_args!("< timestamp \"{}\"", t)),
            Self::After(t) => f.write_fmt(format_args!("> timestamp \"{}\"", t)),
            Self::OnOrBefore(t) => f.write_fmt(format_args!("<= timestamp \"{}\"", t)),
            Self::OnOrAfter(t) => f.write_fmt(format_args!(">= timestamp \"{}\"", t)),
            Self::Absent => f.write_str("absent"),
        }
    }
}

impl MatchOperation {
    fn match_type(&self) -> u32 {
        match self {
            Self::Exists => 0,
            Self::Equal(_) => 1,
            Self::Contains(_) => 2,
            Self::BeginsWith(_) => 3,
            Self::EndsWith(_) => 4,
            Self::LessThan(_) => 5,
            Self::GreaterThan(_) => 6,
            Self::LessThanEqual(_) => 7,
            Self::GreaterThanEqual(_) => 8,
            Self::On(_) => 9,
            Self::Before(_) => 10,
            Self::After(_) => 11,
            Self::OnOrBefore(_) => 12,
            Self::OnOrAfter(_) => 13,
            Self::Absent => 14,
        }
    }

    fn value(&self) -> Option<&RequirementValue> {
        match self {
            Self::Equal(v)
            | Self::Contains(v)
            | Self::BeginsWith(v)
            | Self::EndsWith(v)
            | Self::LessThan(v)
            | Self::GreaterThan(v)
            | Self::LessThanEqual(v)
            | Self::GreaterThanEqual(v) => Some(v),
            _ => None,
        }
    }

    fn timestamp(&self) -> Option<i64> {
        match self {
            Self::On(t) | Self::Before(t) | Self::After(t) | Self::OnOrBefore(t) | Self::OnOrAfter(t) => {
                Some(t.timestamp())
            }
            _ => None,
        }
    }

    /// Number of bytes this operation encodes to.
    pub fn encoded_size(&self) -> usize {
        4 + if let Some(value) = self.value() {
            data_size(value.as_bytes())
        } else if self.timestamp().is_some() {
            8
        } else {
            0
        }
    }

    fn write_to(&self, dest: &mut impl Write) -> Result<(), CodesignError> {
        dest.iowrite_with(self.match_type(), scroll::BE)?;

        if let Some(value) = self.value() {
            write_data(dest, value.as_bytes())?;
        } else if let Some(t) = self.timestamp() {
            dest.iowrite_with(t, scroll::BE)?;
        }

        Ok(())
    }

    fn read_from(data: &[u8], offset: &mut usize) -> Result<Self, CodesignError> {
        let typ = data.gread_with::<u32>(offset, scroll::BE)?;

        let value = |offset: &mut usize| -> Result<RequirementValue, CodesignError> {
            Ok(RequirementValue::from(read_data(data, offset)?))
        };

        Ok(match typ {
            0 => Self::Exists,
            1 => Self::Equal(value(offset)?),
            2 => Self::Contains(value(offset)?),
            3 => Self::BeginsWith(value(offset)?),
            4 => Self::EndsWith(value(offset)?),
            5 => Self::LessThan(value(offset)?),
            6 => Self::GreaterThan(value(offset)?),
            7 => Self::LessThanEqual(value(offset)?),
            8 => Self::GreaterThanEqual(value(offset)?),
            9..=13 => {
                let seconds = data.gread_with::<i64>(offset, scroll::BE)?;
                let t = chrono::Utc
                    .timestamp_opt(seconds, 0)
                    .single()
                    .ok_or(CodesignError::RequirementMalformed("timestamp out of range"))?;

                match typ {
                    9 => Self::On(t),
                    10 => Self::Before(t),
                    11 => Self::After(t),
                    12 => Self::OnOrBefore(t),
                    _ => Self::OnOrAfter(t),
                }
            }
            14 => Self::Absent,
            _ => return Err(CodesignError::RequirementUnknownMatchExpression(typ)),
        })
    }
}

/// Index of a node within a [RequirementExpression].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A single operation in a requirement expression.
///
/// Variants are listed in opcode order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequirementNode {
    /// `never`
    False,
    /// `always`
    True,
    /// `identifier "<string>"`
    Identifier(String),
    /// `anchor apple`
    AnchorApple,
    /// `certificate <slot> = H"<sha1>"`
    AnchorCertificateHash(i32, Vec<u8>),
    /// `info[<key>] = "<value>"`
    InfoKeyValueLegacy(String, String),
    /// `<a> and <b>`
    And(NodeId, NodeId),
    /// `<a> or <b>`
    Or(NodeId, NodeId),
    /// `cdhash H"<digest>"`
    CodeDirectoryHash(Vec<u8>),
    /// `! <a>`
    Not(NodeId),
    /// `info [<key>] <match>`
    InfoPlistKeyField(String, MatchOperation),
    /// `certificate <slot>[<field>] <match>`
    CertificateField(i32, String, MatchOperation),
    /// `certificate <slot> trusted`
    CertificateTrusted(i32),
    /// `anchor trusted`
    AnchorTrusted,
    /// `certificate <slot>[field.<oid>] <match>`
    CertificateGeneric(i32, Oid, MatchOperation),
    /// `anchor apple generic`
    AnchorAppleGeneric,
    /// `entitlement [<key>] <match>`
    EntitlementsKey(String, MatchOperation),
    /// `certificate <slot>[policy.<oid>] <match>`
    CertificatePolicy(i32, Oid, MatchOperation),
    /// `anchor apple <name>`
    NamedAnchor(String),
    /// `(<name>)`
    NamedCode(String),
    /// `platform = <value>`
    Platform(u32),
    /// `notarized`
    Notarized,
    /// `certificate <slot>[timestamp.<oid>] <match>`
    CertificateFieldDate(i32, Oid, MatchOperation),
    /// `legacy`
    LegacyDeveloperId,
}

impl RequirementNode {
    fn opcode(&self) -> u32 {
        match self {
            Self::False => 0,
            Self::True => 1,
            Self::Identifier(_) => 2,
            Self::AnchorApple => 3,
            Self::AnchorCertificateHash(..) => 4,
            Self::InfoKeyValueLegacy(..) => 5,
            Self::And(..) => 6,
            Self::Or(..) => 7,
            Self::CodeDirectoryHash(_) => 8,
            Self::Not(_) => 9,
            Self::InfoPlistKeyField(..) => 10,
            Self::CertificateField(..) => 11,
            Self::CertificateTrusted(_) => 12,
            Self::AnchorTrusted => 13,
            Self::CertificateGeneric(..) => 14,
            Self::AnchorAppleGeneric => 15,
            Self::EntitlementsKey(..) => 16,
            Self::CertificatePolicy(..) => 17,
            Self::NamedAnchor(_) => 18,
            Self::NamedCode(_) => 19,
            Self::Platform(_) => 20,
            Self::Notarized => 21,
            Self::CertificateFieldDate(..) => 22,
            Self::LegacyDeveloperId => 23,
        }
    }

    /// Operand nodes of this node.
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            Self::And(a, b) | Self::Or(a, b) => vec![*a, *b],
            Self::Not(a) => vec![*a],
            _ => vec![],
        }
    }

    /// Encoded size of this node excluding its operand nodes.
    fn own_size(&self) -> usize {
        4 + match self {
            Self::False
            | Self::True
            | Self::AnchorApple
            | Self::AnchorTrusted
            | Self::AnchorAppleGeneric
            | Self::Notarized
            | Self::LegacyDeveloperId
            | Self::And(..)
            | Self::Or(..)
            | Self::Not(_) => 0,
            Self::Identifier(s) | Self::NamedAnchor(s) | Self::NamedCode(s) => {
                data_size(s.as_bytes())
            }
            Self::CodeDirectoryHash(digest) => data_size(digest),
            Self::AnchorCertificateHash(_, digest) => 4 + data_size(digest),
            Self::InfoKeyValueLegacy(key, value) => {
                data_size(key.as_bytes()) + data_size(value.as_bytes())
            }
            Self::InfoPlistKeyField(key, m) | Self::EntitlementsKey(key, m) => {
                data_size(key.as_bytes()) + m.encoded_size()
            }
            Self::CertificateField(_, field, m) => 4 + data_size(field.as_bytes()) + m.encoded_size(),
            Self::CertificateTrusted(_) | Self::Platform(_) => 4,
            Self::CertificateGeneric(_, oid, m)
            | Self::CertificatePolicy(_, oid, m)
            | Self::CertificateFieldDate(_, oid, m) => 4 + data_size(oid.as_ref()) + m.encoded_size(),
        }
    }

    /// Write the opcode and operands, excluding operand nodes.
    fn write_own(&self, dest: &mut impl Write) -> Result<(), CodesignError> {
        dest.iowrite_with(self.opcode(), scroll::BE)?;

        match self {
            Self::False
            | Self::True
            | Self::AnchorApple
            | Self::AnchorTrusted
            | Self::AnchorAppleGeneric
            | Self::Notarized
            | Self::LegacyDeveloperId
            | Self::And(..)
            | Self::Or(..)
            | Self::Not(_) => {}
            Self::Identifier(s) | Self::NamedAnchor(s) | Self::NamedCode(s) => {
                write_data(dest, s.as_bytes())?;
            }
            Self::CodeDirectoryHash(digest) => {
                write_data(dest, digest)?;
            }
            Self::AnchorCertificateHash(slot, digest) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, digest)?;
            }
            Self::InfoKeyValueLegacy(key, value) => {
                write_data(dest, key.as_bytes())?;
                write_data(dest, value.as_bytes())?;
            }
            Self::InfoPlistKeyField(key, m) | Self::EntitlementsKey(key, m) => {
                write_data(dest, key.as_bytes())?;
                m.write_to(dest)?;
            }
            Self::CertificateField(slot, field, m) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, field.as_bytes())?;
                m.write_to(dest)?;
            }
            Self::CertificateTrusted(slot) => {
                dest.iowrite_with(*slot, scroll::BE)?;
            }
            Self::Platform(value) => {
                dest.iowrite_with(*value, scroll::BE)?;
            }
            Self::CertificateGeneric(slot, oid, m)
            | Self::CertificatePolicy(slot, oid, m)
            | Self::CertificateFieldDate(slot, oid, m) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, oid.as_ref())?;
                m.write_to(dest)?;
            }
        }

        Ok(())
    }
}

/// Incrementally assembles a [RequirementExpression].
#[derive(Clone, Debug, Default)]
pub struct ExpressionBuilder {
    nodes: Vec<RequirementNode>,
}

impl ExpressionBuilder {
    /// Add a node, returning its id.
    ///
    /// Operand ids must refer to nodes that were already added.
    pub fn push(&mut self, node: RequirementNode) -> Result<NodeId, CodesignError> {
        if node.children().iter().any(|id| id.0 >= self.nodes.len()) {
            return Err(CodesignError::RequirementMalformed(
                "operand refers to a node not yet added",
            ));
        }

        self.nodes.push(node);

        Ok(NodeId(self.nodes.len() - 1))
    }

    pub fn and(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, CodesignError> {
        self.push(RequirementNode::And(a, b))
    }

    pub fn or(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, CodesignError> {
        self.push(RequirementNode::Or(a, b))
    }

    pub fn not(&mut self, a: NodeId) -> Result<NodeId, CodesignError> {
        self.push(RequirementNode::Not(a))
    }

    /// Finish building with `root` as the top-level node.
    pub fn build(self, root: NodeId) -> Result<RequirementExpression, CodesignError> {
        if root.0 >= self.nodes.len() {
            return Err(CodesignError::RequirementMalformed("root node does not exist"));
        }

        Ok(RequirementExpression {
            nodes: self.nodes,
            root,
        })
    }
}

/// A requirement expression tree.
#[derive(Clone, Debug)]
pub struct RequirementExpression {
    nodes: Vec<RequirementNode>,
    root: NodeId,
}

impl PartialEq for RequirementExpression {
    fn eq(&self, other: &Self) -> bool {
        self.subtree_eq(self.root, other, other.root)
    }
}

impl Eq for RequirementExpression {}

impl Display for RequirementExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.fmt_node(self.root, f)
    }
}

impl RequirementExpression {
    pub fn builder() -> ExpressionBuilder {
        ExpressionBuilder::default()
    }

    /// An expression consisting of a single node.
    pub fn single(node: RequirementNode) -> Result<Self, CodesignError> {
        let mut builder = Self::builder();
        let root = builder.push(node)?;
        builder.build(root)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&RequirementNode> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> &[RequirementNode] {
        &self.nodes
    }

    fn node_checked(&self, id: NodeId) -> Result<&RequirementNode, CodesignError> {
        self.node(id)
            .ok_or(CodesignError::RequirementMalformed("dangling node reference"))
    }

    fn subtree_eq(&self, a: NodeId, other: &Self, b: NodeId) -> bool {
        match (self.node(a), other.node(b)) {
            (Some(RequirementNode::And(a0, a1)), Some(RequirementNode::And(b0, b1)))
            | (Some(RequirementNode::Or(a0, a1)), Some(RequirementNode::Or(b0, b1))) => {
                self.subtree_eq(*a0, other, *b0) && self.subtree_eq(*a1, other, *b1)
            }
            (Some(RequirementNode::Not(a0)), Some(RequirementNode::Not(b0))) => {
                self.subtree_eq(*a0, other, *b0)
            }
            (Some(x), Some(y)) => x.children().is_empty() && x == y,
            _ => false,
        }
    }

    /// Encoded size of every node's subtree, indexed by node id.
    fn subtree_sizes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let children = node
                .children()
                .iter()
                .map(|id| sizes.get(id.0).copied().unwrap_or(0))
                .sum::<usize>();

            sizes.push(node.own_size() + children);
        }

        sizes
    }

    /// Number of bytes the binary encoding occupies.
    pub fn size(&self) -> usize {
        self.subtree_sizes().get(self.root.0).copied().unwrap_or(0)
    }

    fn write_node(&self, id: NodeId, dest: &mut impl Write) -> Result<(), CodesignError> {
        let node = self.node_checked(id)?;
        node.write_own(dest)?;

        for child in node.children() {
            self.write_node(child, dest)?;
        }

        Ok(())
    }

    /// Produce the binary encoding of this expression.
    ///
    /// The blob header is not included.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodesignError> {
        let size = self.size();
        let mut dest = Vec::with_capacity(size);
        self.write_node(self.root, &mut dest)?;

        if dest.len() != size {
            return Err(CodesignError::RequirementSizeMismatch {
                computed: size,
                written: dest.len(),
            });
        }

        Ok(dest)
    }

    /// Decode an expression from the start of `data`.
    ///
    /// Returns the expression and the number of bytes consumed.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), CodesignError> {
        let mut nodes = vec![];
        let mut offset = 0;
        let root = Self::read_node(data, &mut offset, &mut nodes, 0)?;

        Ok((Self { nodes, root }, offset))
    }

    fn read_node(
        data: &[u8],
        offset: &mut usize,
        nodes: &mut Vec<RequirementNode>,
        depth: usize,
    ) -> Result<NodeId, CodesignError> {
        if depth > MAX_DECODE_DEPTH {
            return Err(CodesignError::RequirementMalformed("expression nesting too deep"));
        }

        let opcode = data.gread_with::<u32>(offset, scroll::BE)? & OPCODE_VALUE_MASK;

        let node = match opcode {
            0 => RequirementNode::False,
            1 => RequirementNode::True,
            2 => RequirementNode::Identifier(read_string(data, offset, "identifier not UTF-8")?),
            3 => RequirementNode::AnchorApple,
            4 => {
                let slot = data.gread_with::<i32>(offset, scroll::BE)?;
                RequirementNode::AnchorCertificateHash(slot, read_data(data, offset)?.to_vec())
            }
            5 => {
                let key = read_string(data, offset, "info key not UTF-8")?;
                let value = read_string(data, offset, "info value not UTF-8")?;
                RequirementNode::InfoKeyValueLegacy(key, value)
            }
            6 | 7 => {
                let a = Self::read_node(data, offset, nodes, depth + 1)?;
                let b = Self::read_node(data, offset, nodes, depth + 1)?;

                if opcode == 6 {
                    RequirementNode::And(a, b)
                } else {
                    RequirementNode::Or(a, b)
                }
            }
            8 => RequirementNode::CodeDirectoryHash(read_data(data, offset)?.to_vec()),
            9 => RequirementNode::Not(Self::read_node(data, offset, nodes, depth + 1)?),
            10 => {
                let key = read_string(data, offset, "info key not UTF-8")?;
                RequirementNode::InfoPlistKeyField(key, MatchOperation::read_from(data, offset)?)
            }
            11 => {
                let slot = data.gread_with::<i32>(offset, scroll::BE)?;
                let field = read_string(data, offset, "certificate field not UTF-8")?;
                RequirementNode::CertificateField(
                    slot,
                    field,
                    MatchOperation::read_from(data, offset)?,
                )
            }
            12 => RequirementNode::CertificateTrusted(data.gread_with::<i32>(offset, scroll::BE)?),
            13 => RequirementNode::AnchorTrusted,
            14 | 17 | 22 => {
                let slot = data.gread_with::<i32>(offset, scroll::BE)?;
                let oid = Oid(Bytes::copy_from_slice(read_data(data, offset)?));
                let m = MatchOperation::read_from(data, offset)?;

                match opcode {
                    14 => RequirementNode::CertificateGeneric(slot, oid, m),
                    17 => RequirementNode::CertificatePolicy(slot, oid, m),
                    _ => RequirementNode::CertificateFieldDate(slot, oid, m),
                }
            }
            15 => RequirementNode::AnchorAppleGeneric,
            16 => {
                let key = read_string(data, offset, "entitlement key not UTF-8")?;
                RequirementNode::EntitlementsKey(key, MatchOperation::read_from(data, offset)?)
            }
            18 => RequirementNode::NamedAnchor(read_string(data, offset, "named anchor not UTF-8")?),
            19 => RequirementNode::NamedCode(read_string(data, offset, "named code not UTF-8")?),
            20 => RequirementNode::Platform(data.gread_with::<u32>(offset, scroll::BE)?),
            21 => RequirementNode::Notarized,
            23 => RequirementNode::LegacyDeveloperId,
            _ => return Err(CodesignError::RequirementUnknownOpcode(opcode)),
        };

        nodes.push(node);

        Ok(NodeId(nodes.len() - 1))
    }

    fn fmt_operand(
        &self,
        id: NodeId,
        parenthesize: impl Fn(&RequirementNode) -> bool,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match self.node(id) {
            Some(node) if parenthesize(node) => {
                f.write_str("(")?;
                self.fmt_node(id, f)?;
                f.write_str(")")
            }
            _ => self.fmt_node(id, f),
        }
    }

    fn fmt_node(&self, id: NodeId, f: &mut Formatter<'_>) -> std::fmt::Result {
        let node = match self.node(id) {
            Some(node) => node,
            None => return f.write_str("<invalid>"),
        };

        match node {
            RequirementNode::False => f.write_str("never"),
            RequirementNode::True => f.write_str("always"),
            RequirementNode::Identifier(value) => {
                f.write_fmt(format_args!("identifier \"{}\"", value))
            }
            RequirementNode::AnchorApple => f.write_str("anchor apple"),
            RequirementNode::AnchorCertificateHash(slot, digest) => f.write_fmt(format_args!(
                "certificate {} = H\"{}\"",
                format_certificate_slot(*slot),
                hex::encode(digest)
            )),
            RequirementNode::InfoKeyValueLegacy(key, value) => {
                f.write_fmt(format_args!("info[{}] = \"{}\"", key, value))
            }
            RequirementNode::And(a, b) => {
                let is_or = |n: &RequirementNode| matches!(n, RequirementNode::Or(..));
                self.fmt_operand(*a, is_or, f)?;
                f.write_str(" and ")?;
                self.fmt_operand(*b, is_or, f)
            }
            RequirementNode::Or(a, b) => {
                self.fmt_node(*a, f)?;
                f.write_str(" or ")?;
                self.fmt_node(*b, f)
            }
            RequirementNode::CodeDirectoryHash(digest) => {
                f.write_fmt(format_args!("cdhash H\"{}\"", hex::encode(digest)))
            }
            RequirementNode::Not(a) => {
                f.write_str("! ")?;
                self.fmt_operand(
                    *a,
                    |n| matches!(n, RequirementNode::And(..) | RequirementNode::Or(..)),
                    f,
                )
            }
            RequirementNode::InfoPlistKeyField(key, m) => {
                f.write_fmt(format_args!("info [{}] {}", key, m))
            }
            RequirementNode::CertificateField(slot, field, m) => f.write_fmt(format_args!(
                "certificate {}[{}] {}",
                format_certificate_slot(*slot),
                field,
                m
            )),
            RequirementNode::CertificateTrusted(slot) => f.write_fmt(format_args!(
                "certificate {} trusted",
                format_certificate_slot(*slot)
            )),
            RequirementNode::AnchorTrusted => f.write_str("anchor trusted"),
            RequirementNode::CertificateGeneric(slot, oid, m) => f.write_fmt(format_args!(
                "certificate {}[field.{}] {}",
                format_certificate_slot(*slot),
                oid,
                m
            )),
            RequirementNode::AnchorAppleGeneric => f.write_str("anchor apple generic"),
            RequirementNode::EntitlementsKey(key, m) => {
                f.write_fmt(format_args!("entitlement [{}] {}", key, m))
            }
            RequirementNode::CertificatePolicy(slot, oid, m) => f.write_fmt(format_args!(
                "certificate {}[policy.{}] {}",
                format_certificate_slot(*slot),
                oid,
                m
            )),
            RequirementNode::NamedAnchor(name) => f.write_fmt(format_args!("anchor apple {}", name)),
            RequirementNode::NamedCode(name) => f.write_fmt(format_args!("({})", name)),
            RequirementNode::Platform(value) => f.write_fmt(format_args!("platform = {}", value)),
            RequirementNode::Notarized => f.write_str("notarized"),
            RequirementNode::CertificateFieldDate(slot, oid, m) => f.write_fmt(format_args!(
                "certificate {}[timestamp.{}] {}",
                format_certificate_slot(*slot),
                oid,
                m
            )),
            RequirementNode::LegacyDeveloperId => f.write_str("legacy"),
        }
    }
}

impl Blob for RequirementExpression {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::Requirement)
    }

    fn from_blob_bytes(data: &[u8]) -> Result<Self, CodesignError> {
        let payload = read_and_validate_blob_header(data, Self::magic(), "requirement blob")?;

        let kind = payload.pread_with::<u32>(0, scroll::BE)?;
        if kind != REQUIREMENT_KIND_EXPRESSION {
            return Err(CodesignError::Unsupported("requirement blobs not in expression form"));
        }

        let (expression, _) = Self::from_bytes(&payload[4..])?;

        Ok(expression)
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError> {
        let mut dest = Vec::with_capacity(4 + self.size());
        dest.iowrite_with(REQUIREMENT_KIND_EXPRESSION, scroll::BE)?;
        dest.write_all(&self.to_bytes()?)?;

        Ok(dest)
    }
}

/// The role a requirement plays within a requirement set.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum RequirementType {
    Host,
    Guest,
    Designated,
    Library,
    Plugin,
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Host,
            2 => Self::Guest,
            3 => Self::Designated,
            4 => Self::Library,
            5 => Self::Plugin,
            _ => Self::Unknown(v),
        }
    }
}

impl From<RequirementType> for u32 {
    fn from(t: RequirementType) -> Self {
        match t {
            RequirementType::Host => 1,
            RequirementType::Guest => 2,
            RequirementType::Designated => 3,
            RequirementType::Library => 4,
            RequirementType::Plugin => 5,
            RequirementType::Unknown(v) => v,
        }
    }
}

impl Display for RequirementType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Guest => f.write_str("guest"),
            Self::Designated => f.write_str("designated"),
            Self::Library => f.write_str("library"),
            Self::Plugin => f.write_str("plugin"),
            Self::Unknown(v) => f.write_fmt(format_args!("unknown ({})", v)),
        }
    }
}

/// A set of requirement expressions keyed by their role.
///
/// Serialized as a count, an index of `(type, offset)` pairs sorted by type
/// and then each requirement blob.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RequirementSet {
    requirements: BTreeMap<u32, RequirementExpression>,
}

impl RequirementSet {
    pub fn set(&mut self, typ: RequirementType, expression: RequirementExpression) {
        self.requirements.insert(u32::from(typ), expression);
    }

    pub fn get(&self, typ: RequirementType) -> Option<&RequirementExpression> {
        self.requirements.get(&u32::from(typ))
    }

    pub fn iter(&self) -> impl Iterator<Item = (RequirementType, &RequirementExpression)> {
        self.requirements
            .iter()
            .map(|(typ, expr)| (RequirementType::from(*typ), expr))
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl Display for RequirementSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (typ, expr) in self.iter() {
            f.write_fmt(format_args!("{} => {}\n", typ, expr))?;
        }

        Ok(())
    }
}

impl Blob for RequirementSet {
    fn magic() -> u32 {
        u32::from(CodeSigningMagic::RequirementSet)
    }

    fn from_blob_bytes(data: &[u8]) -> Result<Self, CodesignError> {
        let payload = read_and_validate_blob_header(data, Self::magic(), "requirement set blob")?;
        // Index offsets are relative to the start of the blob.
        let blob = &data[..payload.len() + 8];

        let mut offset = 8;
        let count = blob.gread_with::<u32>(&mut offset, scroll::BE)?;

        let mut requirements = BTreeMap::new();

        for _ in 0..count {
            let typ = blob.gread_with::<u32>(&mut offset, scroll::BE)?;
            let blob_offset = blob.gread_with::<u32>(&mut offset, scroll::BE)? as usize;

            let entry = blob.get(blob_offset..).ok_or(CodesignError::RequirementMalformed(
                "requirement offset out of bounds",
            ))?;

            requirements.insert(typ, RequirementExpression::from_blob_bytes(entry)?);
        }

        Ok(Self { requirements })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, CodesignError> {
        let blobs = self
            .requirements
            .iter()
            .map(|(typ, expr)| Ok((*typ, expr.to_blob_bytes()?)))
            .collect::<Result<Vec<_>, CodesignError>>()?;

        let mut dest = vec![];
        dest.iowrite_with(blobs.len() as u32, scroll::BE)?;

        let mut blob_offset = 8 + 4 + 8 * blobs.len();
        for (typ, blob) in &blobs {
            dest.iowrite_with(*typ, scroll::BE)?;
            dest.iowrite_with(blob_offset as u32, scroll::BE)?;
            blob_offset += blob.len();
        }

        for (_, blob) in blobs {
            dest.write_all(&blob)?;
        }

        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_and_reencode(source: &[u8]) -> RequirementExpression {
        let (expr, consumed) = RequirementExpression::from_bytes(source).unwrap();
        assert_eq!(consumed, source.len());
        assert_eq!(expr.size(), source.len());
        assert_eq!(expr.to_bytes().unwrap(), source);

        expr
    }

    #[test]
    fn leaf_opcodes() {
        for (source, expected) in [
            ("00000000", RequirementNode::False),
            ("00000001", RequirementNode::True),
            (
                "0000000200000007666f6f2e62617200",
                RequirementNode::Identifier("foo.bar".into()),
            ),
            (
                "00000004ffffffff00000014deadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
                RequirementNode::AnchorCertificateHash(
                    -1,
                    hex::decode("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef").unwrap(),
                ),
            ),
            (
                "0000000bffffffff0000000a7375626a6563742e434e000000000000",
                RequirementNode::CertificateField(-1, "subject.CN".into(), MatchOperation::Exists),
            ),
            (
                "0000000effffffff000000035504030000000000",
                RequirementNode::CertificateGeneric(
                    -1,
                    Oid(Bytes::from_static(&[0x55, 4, 3])),
                    MatchOperation::Exists,
                ),
            ),
            ("0000000f", RequirementNode::AnchorAppleGeneric),
            ("000000140000000a", RequirementNode::Platform(10)),
            ("00000017", RequirementNode::LegacyDeveloperId),
        ] {
            let source = hex::decode(source).unwrap();
            let expr = parse_and_reencode(&source);
            assert_eq!(expr, RequirementExpression::single(expected).unwrap());
        }
    }

    #[test]
    fn match_operations() {
        let expr = parse_and_reencode(
            &hex::decode("0000000a000000036b657900000000010000000576616c7565000000").unwrap(),
        );
        assert_eq!(
            expr.node(expr.root()),
            Some(&RequirementNode::InfoPlistKeyField(
                "key".into(),
                MatchOperation::Equal("value".into())
            ))
        );
        assert_eq!(expr.to_string(), "info [key] = \"value\"");

        let expr = parse_and_reencode(
            &hex::decode("0000000a000000036b6579000000000c00000000605fca30").unwrap(),
        );
        assert_eq!(
            expr.node(expr.root()),
            Some(&RequirementNode::InfoPlistKeyField(
                "key".into(),
                MatchOperation::OnOrBefore(chrono::Utc.timestamp_opt(1616890416, 0).unwrap())
            ))
        );

        assert!(matches!(
            RequirementExpression::from_bytes(&hex::decode("0000000a000000036b65790000000063").unwrap()),
            Err(CodesignError::RequirementUnknownMatchExpression(0x63))
        ));
    }

    #[test]
    fn nested_expression_arena() {
        let mut builder = RequirementExpression::builder();
        let ident = builder
            .push(RequirementNode::Identifier("com.example.tool".into()))
            .unwrap();
        let anchor = builder.push(RequirementNode::AnchorAppleGeneric).unwrap();
        let team = builder
            .push(RequirementNode::CertificateField(
                0,
                "subject.OU".into(),
                MatchOperation::Equal("TEAM123".into()),
            ))
            .unwrap();
        let inner = builder.and(anchor, team).unwrap();
        let root = builder.and(ident, inner).unwrap();
        let expr = builder.build(root).unwrap();

        assert_eq!(
            expr.to_string(),
            "identifier \"com.example.tool\" and anchor apple generic and certificate leaf[subject.OU] = \"TEAM123\""
        );

        let encoded = expr.to_bytes().unwrap();
        assert_eq!(encoded.len(), expr.size());
        assert_eq!(&encoded[0..4], &[0, 0, 0, 6]);

        let (decoded, _) = RequirementExpression::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, expr);
        assert_eq!(decoded.nodes().len(), 5);
    }

    #[test]
    fn builder_rejects_forward_references() {
        let mut builder = RequirementExpression::builder();
        let t = builder.push(RequirementNode::True).unwrap();
        assert!(builder.and(t, NodeId(7)).is_err());
        assert!(builder.clone().build(NodeId(3)).is_err());

        let not = builder.not(t).unwrap();
        let expr = builder.build(not).unwrap();
        assert_eq!(expr.to_string(), "! always");
    }

    #[test]
    fn truncated_and_unknown_input() {
        assert!(RequirementExpression::from_bytes(&[0, 0, 0]).is_err());
        assert!(matches!(
            RequirementExpression::from_bytes(&hex::decode("00000063").unwrap()),
            Err(CodesignError::RequirementUnknownOpcode(0x63))
        ));
        // Identifier claims 0x20 bytes but only 4 follow.
        assert!(RequirementExpression::from_bytes(
            &hex::decode("0000000200000020666f6f00").unwrap()
        )
        .is_err());
        // And with a missing right operand.
        assert!(RequirementExpression::from_bytes(&hex::decode("0000000600000001").unwrap()).is_err());
    }

    #[test]
    fn requirement_blob() {
        let source = hex::decode("fade0c00000000100000000100000000").unwrap();
        let expr = RequirementExpression::from_blob_bytes(&source).unwrap();
        assert_eq!(expr, RequirementExpression::single(RequirementNode::False).unwrap());
        assert_eq!(expr.to_blob_bytes().unwrap(), source);
    }

    #[test]
    fn requirement_set_index_is_sorted() {
        let mut set = RequirementSet::default();
        set.set(
            RequirementType::Library,
            RequirementExpression::single(RequirementNode::True).unwrap(),
        );
        set.set(
            RequirementType::Designated,
            RequirementExpression::single(RequirementNode::Identifier("x".into())).unwrap(),
        );

        let blob = set.to_blob_bytes().unwrap();
        assert_eq!(blob.pread_with::<u32>(0, scroll::BE).unwrap(), 0xfade0c01);
        assert_eq!(blob.pread_with::<u32>(4, scroll::BE).unwrap() as usize, blob.len());
        assert_eq!(blob.pread_with::<u32>(8, scroll::BE).unwrap(), 2);
        assert_eq!(blob.pread_with::<u32>(12, scroll::BE).unwrap(), 3);
        assert_eq!(blob.pread_with::<u32>(16, scroll::BE).unwrap(), 28);
        assert_eq!(blob.pread_with::<u32>(20, scroll::BE).unwrap(), 4);

        let parsed = RequirementSet::from_blob_bytes(&blob).unwrap();
        assert_eq!(parsed, set);
        assert_eq!(
            parsed.get(RequirementType::Designated).unwrap().to_string(),
            "identifier \"x\""
        );
    }
}
