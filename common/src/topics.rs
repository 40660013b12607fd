pub fn data_topic(device_id: &str) -> String {
    format!("greenhouse/{device_id}/data")
}

pub fn alerts_topic(device_id: &str) -> String {
    format!("greenhouse/{device_id}/alerts")
}

pub fn commands_topic(device_id: &str) -> String {
    format!("greenhouse/{device_id}/commands")
}
