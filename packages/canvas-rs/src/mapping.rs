/// Channel-to-sensor mapping in the `"channel:sensor, ..."` form the canvas
/// panel configuration expects. Channels are numbered from 1 and sensors
/// count up from `sensor_start`.
pub fn generate_channel_mapping(sensor_start: u32, num_channels: usize) -> String {
    (0..num_channels)
        .map(|i| format!("{}:{}", i + 1, u64::from(sensor_start) + i as u64))
        .collect::<Vec<_>>()
        .join(", ")
}
