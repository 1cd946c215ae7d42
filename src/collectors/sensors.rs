use crate::collectors::SourceError;
#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "windows")]
use std::process::Command;

/// Platform temperature API, consulted before the generic sensor table.
pub trait SensorBackend: Send {
    fn name(&self) -> &'static str;
    fn cpu_temperature(&mut self) -> Result<Option<f64>, SourceError>;
}

pub struct NoPlatformSensors;

impl SensorBackend for NoPlatformSensors {
    fn name(&self) -> &'static str {
        "none"
    }

    fn cpu_temperature(&mut self) -> Result<Option<f64>, SourceError> {
        Ok(None)
    }
}

pub fn platform_backend() -> Box<dyn SensorBackend> {
    #[cfg(target_os = "linux")]
    {
        Box::new(LinuxHwmon)
    }
    #[cfg(target_os = "windows")]
    {
        Box::new(WindowsHardwareMonitor)
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Box::new(NoPlatformSensors)
    }
}

/// Picks the CPU temperature out of a generic `(label, celsius)` sensor table.
pub fn pick_cpu_temperature<'a>(readings: impl IntoIterator<Item = (&'a str, f64)>) -> Option<f64> {
    const CPU_MARKERS: [&str; 7] = ["cpu", "core", "package", "tctl", "tdie", "coretemp", "k10temp"];
    const GPU_MARKERS: [&str; 4] = ["gpu", "nvidia", "amdgpu", "radeon"];

    readings
        .into_iter()
        .filter(|(_, t)| t.is_finite() && (0.0..=130.0).contains(t))
        .filter(|(label, _)| {
            let label = label.to_lowercase();
            CPU_MARKERS.iter().any(|m| label.contains(m))
                && !GPU_MARKERS.iter().any(|m| label.contains(m))
        })
        .map(|(_, t)| t)
        .max_by(|a, b| a.total_cmp(b))
}

#[cfg(target_os = "linux")]
pub struct LinuxHwmon;

#[cfg(target_os = "linux")]
impl SensorBackend for LinuxHwmon {
    fn name(&self) -> &'static str {
        "hwmon"
    }

    fn cpu_temperature(&mut self) -> Result<Option<f64>, SourceError> {
        const CPU_DRIVERS: [&str; 4] = ["coretemp", "k10temp", "zenpower", "cpu_thermal"];

        let entries = fs::read_dir("/sys/class/hwmon")
            .map_err(|err| SourceError::Unavailable(format!("/sys/class/hwmon: {err}")))?;

        let mut best: Option<f64> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            let driver = fs::read_to_string(path.join("name")).unwrap_or_default();
            if !CPU_DRIVERS.contains(&driver.trim()) {
                continue;
            }
            let Ok(files) = fs::read_dir(&path) else {
                continue;
            };
            for file in files.flatten() {
                let name = file.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if !(name.starts_with("temp") && name.ends_with("_input")) {
                    continue;
                }
                let Ok(raw) = fs::read_to_string(file.path()) else {
                    continue;
                };
                let Ok(milli) = raw.trim().parse::<f64>() else {
                    continue;
                };
                let celsius = milli / 1000.0;
                if (0.0..=130.0).contains(&celsius) {
                    best = Some(best.map_or(celsius, |b| b.max(celsius)));
                }
            }
        }
        Ok(best)
    }
}

#[cfg(target_os = "windows")]
pub struct WindowsHardwareMonitor;

#[cfg(target_os = "windows")]
impl SensorBackend for WindowsHardwareMonitor {
    fn name(&self) -> &'static str {
        "hardware-monitor-wmi"
    }

    fn cpu_temperature(&mut self) -> Result<Option<f64>, SourceError> {
        let script = "$n=@('root/LibreHardwareMonitor','root/OpenHardwareMonitor'); foreach($ns in $n){ try { $s=Get-CimInstance -Namespace $ns -ClassName Sensor -ErrorAction Stop } catch { continue }; if($s){ $s | Where-Object { $_.SensorType -eq 'Temperature' } | ForEach-Object { \"$($_.Name)|$($_.Value)\" }; break } }";
        let output = run_powershell(script)
            .ok_or_else(|| SourceError::Unavailable("powershell not found".to_string()))?;
        if !output.status.success() {
            return Err(SourceError::Transient(format!(
                "powershell exited with {}",
                output.status
            )));
        }

        let text = decode_cmd_stdout(&output.stdout);
        let first_cpu = text.lines().find_map(|line| {
            let mut parts = line.splitn(2, '|').map(str::trim);
            let name = parts.next()?;
            let value = crate::collectors::parse_f64_loose(parts.next()?)?;
            name.contains("CPU").then_some(value)
        });
        Ok(first_cpu)
    }
}

#[cfg(target_os = "windows")]
fn run_powershell(script: &str) -> Option<std::process::Output> {
    let wrapped_script = format!(
        "[Console]::OutputEncoding=[System.Text.UTF8Encoding]::new($false); {script}"
    );
    if let Ok(output) = Command::new("powershell")
        .args(["-NoProfile", "-Command", &wrapped_script])
        .output()
    {
        return Some(output);
    }

    Command::new(r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe")
        .args(["-NoProfile", "-Command", &wrapped_script])
        .output()
        .ok()
}

#[cfg(target_os = "windows")]
fn decode_cmd_stdout(bytes: &[u8]) -> String {
    if let Ok(utf8) = std::str::from_utf8(bytes) {
        return utf8.to_string();
    }

    if bytes.len() >= 2 && bytes.len() % 2 == 0 {
        let u16buf: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if let Ok(s) = String::from_utf16(&u16buf) {
            return s;
        }
    }

    String::from_utf8_lossy(bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_hottest_cpu_labelled_sensor() {
        let readings = [
            ("acpitz temp1", 27.8),
            ("coretemp Package id 0", 54.0),
            ("coretemp Core 1", 57.0),
            ("amdgpu edge", 71.0),
        ];
        assert_eq!(pick_cpu_temperature(readings), Some(57.0));
    }

    #[test]
    fn no_cpu_sensor_is_unknown() {
        let readings = [("nvme Composite", 38.0), ("nvidia gpu core", 60.0)];
        assert_eq!(pick_cpu_temperature(readings), None);
    }

    #[test]
    fn zero_degrees_is_a_reading() {
        assert_eq!(pick_cpu_temperature([("CPU", 0.0)]), Some(0.0));
    }

    #[test]
    fn implausible_readings_are_dropped() {
        assert_eq!(pick_cpu_temperature([("cpu", 255.0), ("cpu", f64::NAN)]), None);
    }
}
