//! Protobuf payloads pushed by the Smart Home Panel 2.
//!
//! Only the fields the panel interpreter reads are declared; prost skips the rest.

/// Periodic status push, `cmd_id` 0x01.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtoTime {
    #[prost(message, optional, tag = "2")]
    pub load_info: Option<LoadInfo>,
    #[prost(message, optional, tag = "4")]
    pub watt_info: Option<WattInfo>,
}

/// Per circuit load.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LoadInfo {
    /// Watts, one entry per circuit.
    #[prost(float, repeated, tag = "1")]
    pub hall1_watt: Vec<f32>,
    /// Amperes, one entry per circuit.
    #[prost(float, repeated, tag = "2")]
    pub hall1_curr: Vec<f32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WattInfo {
    #[prost(float, optional, tag = "1")]
    pub grid_watt: Option<f32>,
    /// Watts, one entry per backup channel.
    #[prost(float, repeated, tag = "2")]
    pub ch_watt: Vec<f32>,
    #[prost(float, optional, tag = "3")]
    pub all_hall_watt: Option<f32>,
}

/// Incremental push, `cmd_id` 0x20.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProtoPushAndSet {
    #[prost(message, optional, tag = "1")]
    pub backup_incre_info: Option<BackupIncreInfo>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BackupIncreInfo {
    #[prost(message, optional, tag = "1")]
    pub errcode: Option<ErrCode>,
    #[prost(uint32, optional, tag = "2")]
    pub backup_bat_per: Option<u32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrCode {
    /// 8-byte codes, all zero means no error in that slot.
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub err_code: Vec<Vec<u8>>,
}
