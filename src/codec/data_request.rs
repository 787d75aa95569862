//! Data request descriptor record.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::ValueSize;
use super::{check_record_len, get_fixed_str, put_fixed_str, STRSZ_REQ, STRSZ_UNIT};
use crate::error::Result;
use crate::protocol::{CalcResultType, RequestType, UpdatePeriod};

/// Encoded size of a [`DataRequest`].
pub const DATA_REQUEST_SIZE: usize = 4 * 4 + 5 + STRSZ_REQ + STRSZ_UNIT;

/// A durable subscription to a value the server keeps pushing.
///
/// The request id is chosen by the caller and names the value channel the
/// server writes updates to.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequest {
    pub request_id: u32,
    pub value_size: ValueSize,
    /// Change threshold: `0` = any change, `> 0` = numeric delta, `< 0` = always.
    pub delta_epsilon: f32,
    /// Period multiplier (ticks or milliseconds, depending on `period`).
    pub interval: u32,
    pub period: UpdatePeriod,
    pub request_type: RequestType,
    pub calc_result_type: CalcResultType,
    /// Index for indexed simulator variables (`A:NAV OBS:1`).
    pub sim_var_index: u8,
    /// Variable type prefix for named requests (`A`, `L`, `T`, ...).
    pub var_type_prefix: char,
    /// Variable name, or calculator code for calculated requests.
    pub name_or_code: String,
    pub unit_name: String,
}

impl Default for DataRequest {
    fn default() -> Self {
        Self {
            request_id: 0,
            value_size: ValueSize::Float64,
            delta_epsilon: 0.0,
            interval: 0,
            period: UpdatePeriod::Tick,
            request_type: RequestType::Named,
            calc_result_type: CalcResultType::None,
            sim_var_index: 0,
            var_type_prefix: 'L',
            name_or_code: String::new(),
            unit_name: String::new(),
        }
    }
}

impl DataRequest {
    /// Request for a named variable.
    pub fn named(
        request_id: u32,
        var_type_prefix: char,
        name: impl Into<String>,
        value_size: ValueSize,
    ) -> Self {
        Self {
            request_id,
            var_type_prefix,
            name_or_code: name.into(),
            value_size,
            ..Default::default()
        }
    }

    /// Request for the result of calculator code.
    pub fn calculated(
        request_id: u32,
        code: impl Into<String>,
        calc_result_type: CalcResultType,
        value_size: ValueSize,
    ) -> Self {
        Self {
            request_id,
            request_type: RequestType::Calculated,
            calc_result_type,
            name_or_code: code.into(),
            value_size,
            ..Default::default()
        }
    }

    pub fn unit(mut self, unit_name: impl Into<String>) -> Self {
        self.unit_name = unit_name.into();
        self
    }

    pub fn period(mut self, period: UpdatePeriod, interval: u32) -> Self {
        self.period = period;
        self.interval = interval;
        self
    }

    pub fn epsilon(mut self, delta_epsilon: f32) -> Self {
        self.delta_epsilon = delta_epsilon;
        self
    }

    pub fn sim_var_index(mut self, index: u8) -> Self {
        self.sim_var_index = index;
        self
    }

    /// Byte length of one value update.
    #[inline]
    pub fn value_len(&self) -> u32 {
        self.value_size.byte_len()
    }

    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DATA_REQUEST_SIZE);
        buf.put_u32_le(self.request_id);
        buf.put_u32_le(self.value_size.to_wire());
        buf.put_f32_le(self.delta_epsilon);
        buf.put_u32_le(self.interval);
        buf.put_u8(self.period.as_u8());
        buf.put_u8(self.request_type.as_u8());
        buf.put_u8(self.calc_result_type.as_u8());
        buf.put_u8(self.sim_var_index);
        buf.put_i8(prefix_to_wire(self.var_type_prefix));
        put_fixed_str(&mut buf, &self.name_or_code, STRSZ_REQ);
        put_fixed_str(&mut buf, &self.unit_name, STRSZ_UNIT);
        buf.freeze()
    }

    /// Decode from the fixed wire layout.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        check_record_len("DataRequest", payload, DATA_REQUEST_SIZE)?;
        let mut buf = payload;
        let request_id = buf.get_u32_le();
        let value_size = ValueSize::from_wire(buf.get_u32_le());
        let delta_epsilon = buf.get_f32_le();
        let interval = buf.get_u32_le();
        let period = UpdatePeriod::try_from(buf.get_u8())?;
        let request_type = RequestType::try_from(buf.get_u8())?;
        let calc_result_type = CalcResultType::try_from(buf.get_u8())?;
        let sim_var_index = buf.get_u8();
        let var_type_prefix = buf.get_i8() as u8 as char;
        let name_or_code = get_fixed_str(&mut buf, STRSZ_REQ);
        let unit_name = get_fixed_str(&mut buf, STRSZ_UNIT);
        Ok(Self {
            request_id,
            value_size,
            delta_epsilon,
            interval,
            period,
            request_type,
            calc_result_type,
            sim_var_index,
            var_type_prefix,
            name_or_code,
            unit_name,
        })
    }
}

fn prefix_to_wire(prefix: char) -> i8 {
    if prefix.is_ascii() {
        prefix as u8 as i8
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_request_size() {
        assert_eq!(DATA_REQUEST_SIZE, 1088);
        assert_eq!(DataRequest::default().encode().len(), DATA_REQUEST_SIZE);
    }

    #[test]
    fn test_named_request_layout() {
        let req = DataRequest::named(7, 'A', "PLANE ALTITUDE", ValueSize::Float64)
            .unit("feet")
            .period(UpdatePeriod::Millisecond, 250)
            .epsilon(0.5);
        let bytes = req.encode();

        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &(-6i32 as u32).to_le_bytes());
        assert_eq!(&bytes[8..12], &0.5f32.to_le_bytes());
        assert_eq!(&bytes[12..16], &250u32.to_le_bytes());
        assert_eq!(bytes[16], UpdatePeriod::Millisecond.as_u8());
        assert_eq!(bytes[17], RequestType::Named.as_u8());
        assert_eq!(bytes[20], b'A');
        assert_eq!(&bytes[21..35], b"PLANE ALTITUDE");
        assert_eq!(&bytes[21 + STRSZ_REQ..21 + STRSZ_REQ + 4], b"feet");

        assert_eq!(DataRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn test_calculated_request() {
        let req = DataRequest::calculated(
            3,
            "(A:ATC ID, string)",
            CalcResultType::String,
            ValueSize::Bytes(32),
        );
        assert_eq!(req.request_type, RequestType::Calculated);
        assert_eq!(req.value_len(), 32);

        let decoded = DataRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded.calc_result_type, CalcResultType::String);
        assert_eq!(decoded.value_size, ValueSize::Bytes(32));
    }

    #[test]
    fn test_decode_wrong_length() {
        assert!(DataRequest::decode(&[0u8; 100]).is_err());
    }
}
