//! Keystore2 / KeyMint data types carried in intercepted payloads.

use crate::parcel::{ParcelError, ParcelReader, ParcelWriter, Parcelable};

pub mod rkp;

pub const KEYSTORE_DESCRIPTOR: &str = "android.system.keystore2.IKeystoreService";
pub const SECURITY_LEVEL_DESCRIPTOR: &str = "android.system.keystore2.IKeystoreSecurityLevel";

/// Transaction codes of the intercepted interfaces.
pub mod opcode {
    pub const KEYSTORE_GET_KEY_ENTRY: u32 = 2;
    pub const SECURITY_LEVEL_GENERATE_KEY: u32 = 2;
    pub const RKP_GET_HARDWARE_INFO: u32 = 1;
    pub const RKP_GENERATE_KEY_PAIR: u32 = 2;
    pub const RKP_GENERATE_CERTIFICATE_REQUEST: u32 = 3;
    pub const RKP_GENERATE_CERTIFICATE_REQUEST_V2: u32 = 4;
}

pub mod security_level {
    pub const SOFTWARE: i32 = 0;
    pub const TRUSTED_ENVIRONMENT: i32 = 1;
    pub const STRONGBOX: i32 = 2;
}

pub mod algorithm {
    pub const RSA: i32 = 1;
    pub const EC: i32 = 3;
}

pub const KEY_ORIGIN_GENERATED: i32 = 0;

/// KeyMint tags: a type in the high nibble, an id in the low bits.
pub mod tag {
    const ENUM: i32 = 0x1000_0000;
    const ENUM_REP: i32 = 0x2000_0000;
    const UINT: i32 = 0x3000_0000;
    const ULONG: i32 = 0x5000_0000;
    const DATE: i32 = 0x6000_0000;
    const BOOL: i32 = 0x7000_0000;
    const BIGNUM: i32 = 0x8000_0000u32 as i32;
    const BYTES: i32 = 0x9000_0000u32 as i32;

    pub const PURPOSE: i32 = ENUM_REP | 1;
    pub const ALGORITHM: i32 = ENUM | 2;
    pub const KEY_SIZE: i32 = UINT | 3;
    pub const BLOCK_MODE: i32 = ENUM_REP | 4;
    pub const DIGEST: i32 = ENUM_REP | 5;
    pub const PADDING: i32 = ENUM_REP | 6;
    pub const EC_CURVE: i32 = ENUM | 10;
    pub const RSA_PUBLIC_EXPONENT: i32 = ULONG | 200;
    pub const USER_ID: i32 = UINT | 501;
    pub const NO_AUTH_REQUIRED: i32 = BOOL | 503;
    pub const CREATION_DATETIME: i32 = DATE | 701;
    pub const ORIGIN: i32 = ENUM | 702;
    pub const OS_VERSION: i32 = UINT | 705;
    pub const OS_PATCHLEVEL: i32 = UINT | 706;
    pub const ATTESTATION_CHALLENGE: i32 = BYTES | 708;
    pub const ATTESTATION_ID_BRAND: i32 = BYTES | 710;
    pub const ATTESTATION_ID_DEVICE: i32 = BYTES | 711;
    pub const ATTESTATION_ID_PRODUCT: i32 = BYTES | 712;
    pub const ATTESTATION_ID_MANUFACTURER: i32 = BYTES | 716;
    pub const ATTESTATION_ID_MODEL: i32 = BYTES | 717;
    pub const VENDOR_PATCHLEVEL: i32 = UINT | 718;
    pub const BOOT_PATCHLEVEL: i32 = UINT | 719;
    pub const CERTIFICATE_SERIAL: i32 = BIGNUM | 1006;
    pub const CERTIFICATE_NOT_BEFORE: i32 = DATE | 1008;
    pub const CERTIFICATE_NOT_AFTER: i32 = DATE | 1009;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub domain: i32,
    pub nspace: i64,
    pub alias: Option<String>,
    pub blob: Option<Vec<u8>>,
}

impl Parcelable for KeyDescriptor {
    fn write_body(&self, out: &mut ParcelWriter) {
        out.write_i32(self.domain);
        out.write_i64(self.nspace);
        out.write_string(self.alias.as_deref());
        out.write_byte_array(self.blob.as_deref());
    }

    fn read_body(input: &mut ParcelReader<'_>) -> Result<Self, ParcelError> {
        Ok(Self {
            domain: input.read_i32()?,
            nspace: input.read_i64()?,
            alias: input.read_string()?,
            blob: input.read_byte_array()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyParameterValue {
    Invalid,
    Algorithm(i32),
    BlockMode(i32),
    PaddingMode(i32),
    Digest(i32),
    EcCurve(i32),
    Origin(i32),
    KeyPurpose(i32),
    HardwareAuthenticatorType(i32),
    SecurityLevel(i32),
    BoolValue(bool),
    Integer(i32),
    LongInteger(i64),
    DateTime(i64),
    Blob(Vec<u8>),
}

impl KeyParameterValue {
    fn union_tag(&self) -> i32 {
        match self {
            Self::Invalid => 0,
            Self::Algorithm(_) => 1,
            Self::BlockMode(_) => 2,
            Self::PaddingMode(_) => 3,
            Self::Digest(_) => 4,
            Self::EcCurve(_) => 5,
            Self::Origin(_) => 6,
            Self::KeyPurpose(_) => 7,
            Self::HardwareAuthenticatorType(_) => 8,
            Self::SecurityLevel(_) => 9,
            Self::BoolValue(_) => 10,
            Self::Integer(_) => 11,
            Self::LongInteger(_) => 12,
            Self::DateTime(_) => 13,
            Self::Blob(_) => 14,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Algorithm(v)
            | Self::BlockMode(v)
            | Self::PaddingMode(v)
            | Self::Digest(v)
            | Self::EcCurve(v)
            | Self::Origin(v)
            | Self::KeyPurpose(v)
            | Self::HardwareAuthenticatorType(v)
            | Self::SecurityLevel(v)
            | Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::LongInteger(v) | Self::DateTime(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(v) => Some(v),
            _ => None,
        }
    }
}

impl Parcelable for KeyParameterValue {
    const SIZED: bool = false;

    fn write_body(&self, out: &mut ParcelWriter) {
        out.write_i32(self.union_tag());
        match self {
            Self::Invalid => out.write_i32(0),
            Self::BoolValue(v) => out.write_bool(*v),
            Self::LongInteger(v) | Self::DateTime(v) => out.write_i64(*v),
            Self::Blob(v) => out.write_byte_array(Some(v.as_slice())),
            other => out.write_i32(other.as_int().unwrap_or(0)),
        }
    }

    fn read_body(input: &mut ParcelReader<'_>) -> Result<Self, ParcelError> {
        let value = match input.read_i32()? {
            0 => {
                input.read_i32()?;
                Self::Invalid
            }
            1 => Self::Algorithm(input.read_i32()?),
            2 => Self::BlockMode(input.read_i32()?),
            3 => Self::PaddingMode(input.read_i32()?),
            4 => Self::Digest(input.read_i32()?),
            5 => Self::EcCurve(input.read_i32()?),
            6 => Self::Origin(input.read_i32()?),
            7 => Self::KeyPurpose(input.read_i32()?),
            8 => Self::HardwareAuthenticatorType(input.read_i32()?),
            9 => Self::SecurityLevel(input.read_i32()?),
            10 => Self::BoolValue(input.read_bool()?),
            11 => Self::Integer(input.read_i32()?),
            12 => Self::LongInteger(input.read_i64()?),
            13 => Self::DateTime(input.read_i64()?),
            14 => Self::Blob(input.read_byte_array()?.unwrap_or_default()),
            other => return Err(ParcelError::UnknownUnionTag(other)),
        };
        Ok(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyParameter {
    pub tag: i32,
    pub value: KeyParameterValue,
}

impl KeyParameter {
    pub fn new(tag: i32, value: KeyParameterValue) -> Self {
        Self { tag, value }
    }
}

impl Parcelable for KeyParameter {
    fn write_body(&self, out: &mut ParcelWriter) {
        out.write_i32(self.tag);
        out.write_parcelable(Some(&self.value));
    }

    fn read_body(input: &mut ParcelReader<'_>) -> Result<Self, ParcelError> {
        Ok(Self {
            tag: input.read_i32()?,
            value: input.read_required("KeyParameter.value")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Authorization {
    pub security_level: i32,
    pub key_parameter: KeyParameter,
}

impl Parcelable for Authorization {
    fn write_body(&self, out: &mut ParcelWriter) {
        out.write_i32(self.security_level);
        out.write_parcelable(Some(&self.key_parameter));
    }

    fn read_body(input: &mut ParcelReader<'_>) -> Result<Self, ParcelError> {
        Ok(Self {
            security_level: input.read_i32()?,
            key_parameter: input.read_required("Authorization.keyParameter")?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyMetadata {
    pub key: KeyDescriptor,
    pub key_security_level: i32,
    pub authorizations: Vec<Authorization>,
    /// Leaf certificate (DER).
    pub certificate: Option<Vec<u8>>,
    /// Remaining chain, concatenated DER.
    pub certificate_chain: Option<Vec<u8>>,
    pub modification_time_ms: i64,
}

impl KeyMetadata {
    /// Leaf first, followed by the rest of the chain. `None` without a leaf.
    pub fn chain(&self) -> Result<Option<Vec<Vec<u8>>>, ParcelError> {
        let Some(leaf) = &self.certificate else {
            return Ok(None);
        };
        let mut chain = vec![leaf.clone()];
        if let Some(rest) = &self.certificate_chain {
            chain.extend(split_der_chain(rest)?);
        }
        Ok(Some(chain))
    }

    pub fn set_chain(&mut self, chain: &[Vec<u8>]) {
        let Some((leaf, rest)) = chain.split_first() else {
            self.certificate = None;
            self.certificate_chain = None;
            return;
        };
        self.certificate = Some(leaf.clone());
        self.certificate_chain = if rest.is_empty() {
            None
        } else {
            Some(rest.concat())
        };
    }
}

impl Parcelable for KeyMetadata {
    fn write_body(&self, out: &mut ParcelWriter) {
        out.write_parcelable(Some(&self.key));
        out.write_i32(self.key_security_level);
        out.write_typed_array(Some(self.authorizations.as_slice()));
        out.write_byte_array(self.certificate.as_deref());
        out.write_byte_array(self.certificate_chain.as_deref());
        out.write_i64(self.modification_time_ms);
    }

    fn read_body(input: &mut ParcelReader<'_>) -> Result<Self, ParcelError> {
        Ok(Self {
            key: input.read_required("KeyMetadata.key")?,
            key_security_level: input.read_i32()?,
            authorizations: input.read_typed_array()?.unwrap_or_default(),
            certificate: input.read_byte_array()?,
            certificate_chain: input.read_byte_array()?,
            modification_time_ms: input.read_i64()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyEntryResponse {
    pub security_level: Option<u64>,
    pub metadata: KeyMetadata,
}

impl Parcelable for KeyEntryResponse {
    fn write_body(&self, out: &mut ParcelWriter) {
        out.write_binder(self.security_level);
        out.write_parcelable(Some(&self.metadata));
    }

    fn read_body(input: &mut ParcelReader<'_>) -> Result<Self, ParcelError> {
        Ok(Self {
            security_level: input.read_binder()?,
            metadata: input.read_required("KeyEntryResponse.metadata")?,
        })
    }
}

/// Key generation request parameters relevant to forging.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyGenParameters {
    pub algorithm: i32,
    pub key_size: i32,
    pub ec_curve: i32,
    pub rsa_public_exponent: Option<i64>,
    pub purposes: Vec<i32>,
    pub digests: Vec<i32>,
    pub block_modes: Vec<i32>,
    pub paddings: Vec<i32>,
    pub no_auth_required: bool,
    pub certificate_serial: Option<Vec<u8>>,
    pub certificate_not_before: Option<i64>,
    pub certificate_not_after: Option<i64>,
    pub attestation_challenge: Option<Vec<u8>>,
    pub brand: Option<Vec<u8>>,
    pub device: Option<Vec<u8>>,
    pub product: Option<Vec<u8>>,
    pub manufacturer: Option<Vec<u8>>,
    pub model: Option<Vec<u8>>,
}

impl KeyGenParameters {
    pub fn from_params(params: &[KeyParameter]) -> Self {
        let mut out = Self::default();
        for param in params {
            let value = &param.value;
            let int = value.as_int().unwrap_or_default();
            let blob = || value.as_blob().map(<[u8]>::to_vec);
            match param.tag {
                tag::ALGORITHM => out.algorithm = int,
                tag::KEY_SIZE => out.key_size = int,
                tag::EC_CURVE => out.ec_curve = int,
                tag::RSA_PUBLIC_EXPONENT => out.rsa_public_exponent = value.as_long(),
                tag::PURPOSE => out.purposes.push(int),
                tag::DIGEST => out.digests.push(int),
                tag::BLOCK_MODE => out.block_modes.push(int),
                tag::PADDING => out.paddings.push(int),
                tag::NO_AUTH_REQUIRED => out.no_auth_required = true,
                tag::CERTIFICATE_SERIAL => out.certificate_serial = blob(),
                tag::CERTIFICATE_NOT_BEFORE => out.certificate_not_before = value.as_long(),
                tag::CERTIFICATE_NOT_AFTER => out.certificate_not_after = value.as_long(),
                tag::ATTESTATION_CHALLENGE => out.attestation_challenge = blob(),
                tag::ATTESTATION_ID_BRAND => out.brand = blob(),
                tag::ATTESTATION_ID_DEVICE => out.device = blob(),
                tag::ATTESTATION_ID_PRODUCT => out.product = blob(),
                tag::ATTESTATION_ID_MANUFACTURER => out.manufacturer = blob(),
                tag::ATTESTATION_ID_MODEL => out.model = blob(),
                _ => {}
            }
        }
        out
    }
}

/// Splits concatenated DER elements by walking their TLV headers.
pub fn split_der_chain(bytes: &[u8]) -> Result<Vec<Vec<u8>>, ParcelError> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let len = der_element_len(&bytes[offset..])?;
        out.push(bytes[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(out)
}

fn der_element_len(bytes: &[u8]) -> Result<usize, ParcelError> {
    if bytes.len() < 2 {
        return Err(ParcelError::MalformedCertificate("truncated header"));
    }
    let first = bytes[1];
    let (header, content) = if first < 0x80 {
        (2usize, first as usize)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 {
            return Err(ParcelError::MalformedCertificate("unsupported length form"));
        }
        if bytes.len() < 2 + n {
            return Err(ParcelError::MalformedCertificate("truncated length"));
        }
        let content = bytes[2..2 + n]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (2 + n, content)
    };
    let total = header + content;
    if total > bytes.len() {
        return Err(ParcelError::MalformedCertificate("element exceeds chain"));
    }
    Ok(total)
}
