//! Remote key provisioning HAL types.

use crate::parcel::{ParcelError, ParcelReader, ParcelWriter, Parcelable};

pub const RKP_DESCRIPTOR: &str = "android.hardware.security.keymint.IRemotelyProvisionedComponent";

/// `RpcHardwareInfo.CURVE_25519`; `CURVE_P256` is 1.
pub const CURVE_25519: i32 = 2;
pub const HARDWARE_INFO_VERSION: i32 = 3;
pub const MAX_KEYS_IN_CSR: i32 = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcHardwareInfo {
    pub version_number: i32,
    pub rpc_author_name: String,
    pub supported_eek_curve: i32,
    pub unique_id: Option<String>,
    pub supported_num_keys_in_csr: i32,
}

impl Parcelable for RpcHardwareInfo {
    fn write_body(&self, out: &mut ParcelWriter) {
        out.write_i32(self.version_number);
        out.write_string(Some(self.rpc_author_name.as_str()));
        out.write_i32(self.supported_eek_curve);
        out.write_string(self.unique_id.as_deref());
        out.write_i32(self.supported_num_keys_in_csr);
    }

    fn read_body(input: &mut ParcelReader<'_>) -> Result<Self, ParcelError> {
        Ok(Self {
            version_number: input.read_i32()?,
            rpc_author_name: input.read_string()?.unwrap_or_default(),
            supported_eek_curve: input.read_i32()?,
            unique_id: input.read_string()?,
            supported_num_keys_in_csr: input.read_i32()?,
        })
    }
}

macro_rules! byte_parcelable {
    ($name:ident, $field:ident) => {
        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        pub struct $name {
            pub $field: Vec<u8>,
        }

        impl Parcelable for $name {
            fn write_body(&self, out: &mut ParcelWriter) {
                out.write_byte_array(Some(self.$field.as_slice()));
            }

            fn read_body(input: &mut ParcelReader<'_>) -> Result<Self, ParcelError> {
                Ok(Self {
                    $field: input.read_byte_array()?.unwrap_or_default(),
                })
            }
        }
    };
}

byte_parcelable!(MacedPublicKey, maced_key);
byte_parcelable!(DeviceInfo, device_info);
byte_parcelable!(ProtectedData, protected_data);
