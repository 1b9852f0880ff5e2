use crate::state::{AcceleratorSample, NodeSnapshot, ProcessSample};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

const SENTINEL_PREFIX: &str = "___SECTION_";
const SENTINEL_SUFFIX: &str = "___";
const NO_ACCELERATOR: &str = "NONE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Gpu,
    Cpu,
    Mem,
    Process,
}

impl Section {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "GPU" => Some(Self::Gpu),
            "CPU" => Some(Self::Cpu),
            "MEM" => Some(Self::Mem),
            "PROCESS" => Some(Self::Process),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gpu => "GPU",
            Self::Cpu => "CPU",
            Self::Mem => "MEM",
            Self::Process => "PROCESS",
        }
    }

    pub fn sentinel(self) -> String {
        format!("{SENTINEL_PREFIX}{}{SENTINEL_SUFFIX}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeDiagnostic {
    pub section: Option<Section>,
    pub line: String,
    pub reason: String,
}

impl DecodeDiagnostic {
    pub fn section_label(&self) -> &'static str {
        self.section.map_or("none", Section::as_str)
    }
}

impl fmt::Display for DecodeDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {:?}", self.section_label(), self.reason, self.line)
    }
}

#[derive(Debug, Clone)]
pub struct Decoded {
    pub snapshot: NodeSnapshot,
    pub diagnostics: Vec<DecodeDiagnostic>,
}

pub fn decode(raw: &str, node_id: Uuid, timestamp_unix: i64) -> Decoded {
    let mut diagnostics = Vec::new();
    let (chunks, preamble) = split_sections(raw, &mut diagnostics);
    let mut snapshot = NodeSnapshot::empty(node_id, timestamp_unix);
    snapshot.connected = true;

    // Older scripts printed the GPU rows first without a sentinel.
    let gpu_lines = match chunks.get(&Section::Gpu) {
        Some(lines) => {
            diagnostics.extend(preamble.iter().map(|line| DecodeDiagnostic {
                section: None,
                line: line.to_string(),
                reason: "text before the first section ignored".to_string(),
            }));
            Some(lines.as_slice())
        }
        None if !preamble.is_empty() => Some(preamble.as_slice()),
        None => None,
    };

    let mut uuid_to_index = HashMap::new();
    if let Some(lines) = gpu_lines {
        snapshot.accelerators = decode_gpu(lines, &mut diagnostics);
        for gpu in &snapshot.accelerators {
            uuid_to_index.insert(gpu.uuid.clone(), gpu.index);
        }
    }
    if let Some(lines) = chunks.get(&Section::Cpu) {
        snapshot.cpu_usage_percent = decode_cpu(lines, &mut diagnostics);
    }
    if let Some(lines) = chunks.get(&Section::Mem) {
        let (total_gb, used_gb) = decode_mem(lines, &mut diagnostics);
        snapshot.ram_total_gb = total_gb;
        snapshot.ram_used_gb = used_gb;
    }
    if let Some(lines) = chunks.get(&Section::Process) {
        snapshot.processes = decode_processes(lines, &uuid_to_index, &mut diagnostics);
    }

    Decoded {
        snapshot,
        diagnostics,
    }
}

fn parse_sentinel(line: &str) -> Option<&str> {
    line.strip_prefix(SENTINEL_PREFIX)?
        .strip_suffix(SENTINEL_SUFFIX)
}

enum Cursor {
    Preamble,
    Collect(Section),
    Skip,
}

/// Splits the payload on sentinel lines. The first chunk of each known
/// section wins; unknown and repeated sections are skipped. Non-empty lines
/// before the first sentinel are returned separately.
fn split_sections<'a>(
    raw: &'a str,
    diagnostics: &mut Vec<DecodeDiagnostic>,
) -> (HashMap<Section, Vec<&'a str>>, Vec<&'a str>) {
    let mut chunks: HashMap<Section, Vec<&str>> = HashMap::new();
    let mut preamble = Vec::new();
    let mut cursor = Cursor::Preamble;

    for line in raw.lines() {
        let trimmed = line.trim();
        if let Some(name) = parse_sentinel(trimmed) {
            cursor = match Section::from_name(name) {
                Some(section) if chunks.contains_key(&section) => {
                    diagnostics.push(DecodeDiagnostic {
                        section: Some(section),
                        line: trimmed.to_string(),
                        reason: "repeated section ignored".to_string(),
                    });
                    Cursor::Skip
                }
                Some(section) => {
                    chunks.insert(section, Vec::new());
                    Cursor::Collect(section)
                }
                None => {
                    diagnostics.push(DecodeDiagnostic {
                        section: None,
                        line: trimmed.to_string(),
                        reason: "unknown section ignored".to_string(),
                    });
                    Cursor::Skip
                }
            };
            continue;
        }

        match cursor {
            Cursor::Collect(section) => {
                if let Some(lines) = chunks.get_mut(&section) {
                    lines.push(line);
                }
            }
            Cursor::Preamble if !trimmed.is_empty() => preamble.push(trimmed),
            Cursor::Preamble | Cursor::Skip => {}
        }
    }
    (chunks, preamble)
}

fn decode_gpu(lines: &[&str], diagnostics: &mut Vec<DecodeDiagnostic>) -> Vec<AcceleratorSample> {
    lines
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .filter_map(|line| match decode_gpu_line(line) {
            Ok(sample) => Some(sample),
            Err(reason) => {
                diagnostics.push(DecodeDiagnostic {
                    section: Some(Section::Gpu),
                    line: line.to_string(),
                    reason,
                });
                None
            }
        })
        .collect()
}

/// Accepts `index,uuid,name,util_gpu,util_mem,mem_used,mem_total,temp,power_draw,power_limit`
/// and the legacy 9-field form without the uuid.
fn decode_gpu_line(line: &str) -> Result<AcceleratorSample, String> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let (index, uuid, name, numeric) = match fields.len() {
        n if n >= 10 => (fields[0], Some(fields[1]), fields[2], &fields[3..10]),
        9 => (fields[0], None, fields[1], &fields[2..9]),
        n => return Err(format!("expected 9 or 10 fields, found {n}")),
    };

    let index: u32 = index
        .parse()
        .map_err(|_| format!("invalid accelerator index {index:?}"))?;
    let values = numeric
        .iter()
        .map(|field| parse_number(field).ok_or_else(|| format!("invalid number {field:?}")))
        .collect::<Result<Vec<f64>, String>>()?;

    Ok(AcceleratorSample {
        index,
        uuid: uuid.map_or_else(|| format!("UNKNOWN-{index}"), str::to_string),
        name: name.to_string(),
        utilization_percent: values[0],
        memory_utilization_percent: values[1],
        memory_used_mb: values[2],
        memory_total_mb: values[3],
        temperature_celsius: values[4],
        power_draw_watts: values[5],
        power_limit_watts: values[6],
    })
}

/// cpu% = 100 - idle, where idle is the first number of the first
/// comma-separated field mentioning `id`.
fn decode_cpu(lines: &[&str], diagnostics: &mut Vec<DecodeDiagnostic>) -> f64 {
    let text = lines.join("\n");
    let idle = text
        .split(',')
        .filter(|field| field.contains("id"))
        .find_map(first_number);

    match idle {
        Some(idle) => (100.0 - idle).max(0.0),
        None => {
            diagnostics.push(DecodeDiagnostic {
                section: Some(Section::Cpu),
                line: text.trim().to_string(),
                reason: "no idle figure found".to_string(),
            });
            0.0
        }
    }
}

fn decode_mem(lines: &[&str], diagnostics: &mut Vec<DecodeDiagnostic>) -> (f64, f64) {
    let numbers: Vec<f64> = lines
        .iter()
        .flat_map(|line| line.split_whitespace())
        .filter_map(parse_number)
        .collect();

    if let [total, used, ..] = numbers[..] {
        (total / 1024.0, used / 1024.0)
    } else {
        diagnostics.push(DecodeDiagnostic {
            section: Some(Section::Mem),
            line: lines.join("\n").trim().to_string(),
            reason: format!("expected two numeric tokens, found {}", numbers.len()),
        });
        (0.0, 0.0)
    }
}

fn decode_processes(
    lines: &[&str],
    uuid_to_index: &HashMap<String, u32>,
    diagnostics: &mut Vec<DecodeDiagnostic>,
) -> Vec<ProcessSample> {
    let sentinel = Section::Process.sentinel();
    let mut processes = Vec::new();

    for line in lines.iter().map(|l| l.trim()) {
        if line.is_empty() || line.contains(&sentinel) {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 5 {
            diagnostics.push(DecodeDiagnostic {
                section: Some(Section::Process),
                line: line.to_string(),
                reason: format!("expected 5 fields, found {}", fields.len()),
            });
            continue;
        }
        let Some(memory_used_mb) = parse_number(fields[2]) else {
            diagnostics.push(DecodeDiagnostic {
                section: Some(Section::Process),
                line: line.to_string(),
                reason: format!("invalid memory value {:?}", fields[2]),
            });
            continue;
        };

        let accelerator_index = if fields[0] == NO_ACCELERATOR {
            None
        } else {
            uuid_to_index.get(fields[0]).copied()
        };
        processes.push(ProcessSample {
            pid: fields[1].to_string(),
            user: fields[3].to_string(),
            command: fields[4].to_string(),
            accelerator_index,
            memory_used_mb,
        });
    }
    processes
}

fn parse_number(field: &str) -> Option<f64> {
    field.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn first_number(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let starts = c.is_ascii_digit()
            || ((c == b'-' || c == b'.') && bytes.get(i + 1).is_some_and(u8::is_ascii_digit));
        if !starts {
            i += 1;
            continue;
        }
        let mut end = i + 1;
        while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
            end += 1;
        }
        if let Some(value) = parse_number(&text[i..end]) {
            return Some(value);
        }
        i = end;
    }
    None
}
