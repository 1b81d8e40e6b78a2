//! DfuSe memory layouts, as advertised in alt-setting names.
//!
//! Example: `@Internal Flash  /0x08000000/04*016Kg,01*064Kg,07*128Kg`

use std::sync::LazyLock;

use nonempty::NonEmpty;
use regex::Regex;

static LAYOUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@([^/]*?)\s*/0x([\da-fA-F]+)U?/(.*)").unwrap());
static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\*(\d+)\s?([KMB ]?)([a-g])(?:,|$)").unwrap());

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuMemory {
    pub name: String,
    pub segments: NonEmpty<DfuMemSegment>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuMemSegment {
    start_addr: u32,
    end_addr: u32,
    page_size: u32,
    mem_type: u8,
}

impl DfuMemory {
    pub fn start_addr(&self) -> u32 {
        self.segments.first().start_addr
    }

    pub fn end_addr(&self) -> u32 {
        self.segments.last().end_addr
    }

    pub fn size(&self) -> u32 {
        self.end_addr() - self.start_addr()
    }

    pub fn segment_for(&self, addr: u32) -> Option<&DfuMemSegment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    /// Segments overlapping `[start_addr, end_addr)`.
    pub fn find_segments(&self, start_addr: u32, end_addr: u32) -> Vec<&DfuMemSegment> {
        self.segments
            .iter()
            .filter(|s| s.start_addr < end_addr && start_addr < s.end_addr)
            .collect()
    }

    /// Start addresses of the erasable pages touched by `[start_addr, end_addr)`.
    pub fn erase_pages(&self, start_addr: u32, end_addr: u32) -> Vec<u32> {
        self.find_segments(start_addr, end_addr)
            .into_iter()
            .filter(|s| s.erasable())
            .flat_map(|s| {
                let (first, count) = s.erase_range(start_addr, end_addr);
                (0..count).map(move |i| first + i * s.page_size)
            })
            .collect()
    }
}

impl DfuMemSegment {
    pub fn start_addr(&self) -> u32 {
        self.start_addr
    }
    pub fn end_addr(&self) -> u32 {
        self.end_addr
    }
    pub fn page_size(&self) -> u32 {
        self.page_size
    }
    pub fn pages(&self) -> u32 {
        (self.end_addr - self.start_addr) / self.page_size
    }
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start_addr && addr < self.end_addr
    }
    /// First page-aligned address and page count covering the overlap.
    fn erase_range(&self, start_addr: u32, end_addr: u32) -> (u32, u32) {
        let start = start_addr.max(self.start_addr);
        let end = end_addr.min(self.end_addr);
        let first = start - (start - self.start_addr) % self.page_size;
        (first, (end - first).div_ceil(self.page_size))
    }
    pub fn readable(&self) -> bool {
        self.mem_type & 1 == 1
    }
    pub fn erasable(&self) -> bool {
        self.mem_type & 2 == 2
    }
    pub fn writable(&self) -> bool {
        self.mem_type & 4 == 4
    }
}

pub(crate) fn parse_memory_layout(mem_layout_str: &str) -> Option<DfuMemory> {
    let captures = LAYOUT_RE.captures(mem_layout_str)?;

    let name = String::from(&captures[1]);
    let start_addr = u32::from_str_radix(&captures[2], 16).ok()?;

    let mut layout = Vec::new();
    let mut current_addr = start_addr;

    for seg_match in SEGMENT_RE.captures_iter(&captures[3]) {
        let pages: u32 = seg_match[1].parse().ok()?;
        let page_size: u32 = seg_match[2].parse::<u32>().ok()?
            * match &seg_match[3] {
                "K" => 1024,
                "M" => 1024 * 1024,
                _ => 1,
            };
        if page_size == 0 {
            return None;
        }

        let mem_type = (seg_match[4].as_bytes()[0]) & 7;
        let end_addr = current_addr.checked_add(pages.checked_mul(page_size)?)?;

        layout.push(DfuMemSegment {
            start_addr: current_addr,
            end_addr,
            page_size,
            mem_type,
        });
        current_addr = end_addr;
    }

    NonEmpty::from_vec(layout).map(|segments| DfuMemory { name, segments })
}
