use lazy_static::lazy_static;
use std::collections::HashMap;

use crate::uuid::Uuid;

/// Human-readable metadata of a standard GATT attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AttributeInfo {
    pub name: &'static str,
    pub type_name: &'static str,
}

/// Common behavior of services, characteristics and descriptors.
pub trait Attribute {
    fn uuid(&self) -> Uuid;

    /// Assigned name of the attribute, e.g. `Battery Level`, if it's a standard one.
    fn name(&self) -> Option<&'static str> {
        lookup(self.uuid()).map(|v| v.name)
    }

    /// Assigned type of the attribute, e.g. `org.bluetooth.characteristic.battery_level`, if
    /// it's a standard one.
    fn type_name(&self) -> Option<&'static str> {
        lookup(self.uuid()).map(|v| v.type_name)
    }
}

pub fn lookup(uuid: Uuid) -> Option<&'static AttributeInfo> {
    REGISTRY.get(&uuid)
}

macro_rules! registry {
    ($($uuid:expr => $name:expr, $type_name:expr;)*) => {{
        let mut r = HashMap::new();
        $(
            r.insert(Uuid::from_u16($uuid), AttributeInfo {
                name: $name,
                type_name: $type_name,
            });
        )*
        r
    }};
}

lazy_static! {
    static ref REGISTRY: HashMap<Uuid, AttributeInfo> = registry! {
        // Services
        0x1800 => "Generic Access", "org.bluetooth.service.generic_access";
        0x1801 => "Generic Attribute", "org.bluetooth.service.generic_attribute";
        0x1802 => "Immediate Alert", "org.bluetooth.service.immediate_alert";
        0x1803 => "Link Loss", "org.bluetooth.service.link_loss";
        0x1804 => "Tx Power", "org.bluetooth.service.tx_power";
        0x1805 => "Current Time Service", "org.bluetooth.service.current_time";
        0x1806 => "Reference Time Update Service", "org.bluetooth.service.reference_time_update";
        0x1807 => "Next DST Change Service", "org.bluetooth.service.next_dst_change";
        0x1808 => "Glucose", "org.bluetooth.service.glucose";
        0x1809 => "Health Thermometer", "org.bluetooth.service.health_thermometer";
        0x180a => "Device Information", "org.bluetooth.service.device_information";
        0x180d => "Heart Rate", "org.bluetooth.service.heart_rate";
        0x180e => "Phone Alert Status Service", "org.bluetooth.service.phone_alert_service";
        0x180f => "Battery Service", "org.bluetooth.service.battery_service";
        0x1810 => "Blood Pressure", "org.bluetooth.service.blood_pressure";
        0x1811 => "Alert Notification Service", "org.bluetooth.service.alert_notification";
        0x1812 => "Human Interface Device", "org.bluetooth.service.human_interface_device";
        0x1813 => "Scan Parameters", "org.bluetooth.service.scan_parameters";
        0x1814 => "Running Speed and Cadence", "org.bluetooth.service.running_speed_and_cadence";
        0x1816 => "Cycling Speed and Cadence", "org.bluetooth.service.cycling_speed_and_cadence";
        0x1818 => "Cycling Power", "org.bluetooth.service.cycling_power";
        0x1819 => "Location and Navigation", "org.bluetooth.service.location_and_navigation";
        0x181a => "Environmental Sensing", "org.bluetooth.service.environmental_sensing";
        0x181c => "User Data", "org.bluetooth.service.user_data";
        0x181d => "Weight Scale", "org.bluetooth.service.weight_scale";

        // Characteristics
        0x2a00 => "Device Name", "org.bluetooth.characteristic.gap.device_name";
        0x2a01 => "Appearance", "org.bluetooth.characteristic.gap.appearance";
        0x2a02 => "Peripheral Privacy Flag", "org.bluetooth.characteristic.gap.peripheral_privacy_flag";
        0x2a03 => "Reconnection Address", "org.bluetooth.characteristic.gap.reconnection_address";
        0x2a04 => "Peripheral Preferred Connection Parameters",
            "org.bluetooth.characteristic.gap.peripheral_preferred_connection_parameters";
        0x2a05 => "Service Changed", "org.bluetooth.characteristic.gatt.service_changed";
        0x2a06 => "Alert Level", "org.bluetooth.characteristic.alert_level";
        0x2a07 => "Tx Power Level", "org.bluetooth.characteristic.tx_power_level";
        0x2a08 => "Date Time", "org.bluetooth.characteristic.date_time";
        0x2a19 => "Battery Level", "org.bluetooth.characteristic.battery_level";
        0x2a1c => "Temperature Measurement", "org.bluetooth.characteristic.temperature_measurement";
        0x2a23 => "System ID", "org.bluetooth.characteristic.system_id";
        0x2a24 => "Model Number String", "org.bluetooth.characteristic.model_number_string";
        0x2a25 => "Serial Number String", "org.bluetooth.characteristic.serial_number_string";
        0x2a26 => "Firmware Revision String", "org.bluetooth.characteristic.firmware_revision_string";
        0x2a27 => "Hardware Revision String", "org.bluetooth.characteristic.hardware_revision_string";
        0x2a28 => "Software Revision String", "org.bluetooth.characteristic.software_revision_string";
        0x2a29 => "Manufacturer Name String", "org.bluetooth.characteristic.manufacturer_name_string";
        0x2a2a => "IEEE 11073-20601 Regulatory Certification Data List",
            "org.bluetooth.characteristic.ieee_11073-20601_regulatory_certification_data_list";
        0x2a2b => "Current Time", "org.bluetooth.characteristic.current_time";
        0x2a31 => "Scan Refresh", "org.bluetooth.characteristic.scan_refresh";
        0x2a35 => "Blood Pressure Measurement", "org.bluetooth.characteristic.blood_pressure_measurement";
        0x2a37 => "Heart Rate Measurement", "org.bluetooth.characteristic.heart_rate_measurement";
        0x2a38 => "Body Sensor Location", "org.bluetooth.characteristic.body_sensor_location";
        0x2a39 => "Heart Rate Control Point", "org.bluetooth.characteristic.heart_rate_control_point";
        0x2a4a => "HID Information", "org.bluetooth.characteristic.hid_information";
        0x2a4b => "Report Map", "org.bluetooth.characteristic.report_map";
        0x2a4c => "HID Control Point", "org.bluetooth.characteristic.hid_control_point";
        0x2a4d => "Report", "org.bluetooth.characteristic.report";
        0x2a4e => "Protocol Mode", "org.bluetooth.characteristic.protocol_mode";
        0x2a4f => "Scan Interval Window", "org.bluetooth.characteristic.scan_interval_window";
        0x2a50 => "PnP ID", "org.bluetooth.characteristic.pnp_id";
        0x2a6e => "Temperature", "org.bluetooth.characteristic.temperature";
        0x2a6f => "Humidity", "org.bluetooth.characteristic.humidity";

        // Descriptors
        0x2900 => "Characteristic Extended Properties",
            "org.bluetooth.descriptor.gatt.characteristic_extended_properties";
        0x2901 => "Characteristic User Description",
            "org.bluetooth.descriptor.gatt.characteristic_user_description";
        0x2902 => "Client Characteristic Configuration",
            "org.bluetooth.descriptor.gatt.client_characteristic_configuration";
        0x2903 => "Server Characteristic Configuration",
            "org.bluetooth.descriptor.gatt.server_characteristic_configuration";
        0x2904 => "Characteristic Presentation Format",
            "org.bluetooth.descriptor.gatt.characteristic_presentation_format";
        0x2905 => "Characteristic Aggregate Format",
            "org.bluetooth.descriptor.gatt.characteristic_aggregate_format";
        0x2906 => "Valid Range", "org.bluetooth.descriptor.valid_range";
        0x2907 => "External Report Reference", "org.bluetooth.descriptor.external_report_reference";
        0x2908 => "Report Reference", "org.bluetooth.descriptor.report_reference";
    };
}

#[cfg(test)]
mod test {
    use super::*;

    struct Plain(Uuid);

    impl Attribute for Plain {
        fn uuid(&self) -> Uuid {
            self.0
        }
    }

    #[test]
    fn standard_names() {
        let a = Plain(Uuid::from_u16(0x1800));
        assert_eq!(a.name(), Some("Generic Access"));
        assert_eq!(a.type_name(), Some("org.bluetooth.service.generic_access"));

        assert_eq!(Plain(Uuid::from_u16(0x2902)).name(), Some("Client Characteristic Configuration"));
        assert_eq!(Plain("ebe0ccb0-7a0a-4b0c-8a1a-6ff2997da3a6".parse().unwrap()).name(), None);
    }
}
