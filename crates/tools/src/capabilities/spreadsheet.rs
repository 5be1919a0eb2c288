//! Workbook access for skills.
//!
//! The store hands out handles (the workbook's absolute path) and keeps open
//! workbooks in memory until saved or closed. `.xlsx` files keep every named
//! sheet; `.csv` files are a single sheet called `Sheet1`. Cell addresses take
//! an optional sheet prefix (`Totals!B2`); without one the first sheet is used.

use calamine::{open_workbook_auto, Data, Reader};
use sisypho_core::{Error, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Last row an xlsx sheet can hold (1-based).
pub const MAX_ROWS: usize = 1_048_576;
/// Last column an xlsx sheet can hold (1-based, `XFD`).
pub const MAX_COLS: usize = 16_384;

const MAX_RANGE_CELLS: usize = 100_000;
const DEFAULT_SHEET: &str = "Sheet1";

/// A zero-based cell position parsed from A1 notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRef {
    pub row: usize,
    pub col: usize,
}

impl CellRef {
    /// Parse `B3`, `aa10` and friends, up to `XFD1048576`.
    pub fn parse(a1: &str) -> Result<Self> {
        let a1 = a1.trim();
        let invalid = || Error::Tool(format!("invalid cell reference '{}'", a1));
        let split = a1.find(|c: char| c.is_ascii_digit()).ok_or_else(invalid)?;
        let (letters, digits) = a1.split_at(split);
        if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid());
        }
        let row: usize = digits.parse().map_err(|_| invalid())?;
        if row == 0 || row > MAX_ROWS {
            return Err(invalid());
        }
        let mut col = 0usize;
        for c in letters.bytes() {
            col = col
                .checked_mul(26)
                .and_then(|acc| acc.checked_add((c.to_ascii_uppercase() - b'A') as usize + 1))
                .filter(|&n| n <= MAX_COLS)
                .ok_or_else(invalid)?;
        }
        Ok(Self { row: row - 1, col: col - 1 })
    }

    /// The cell `rows` down and `cols` right of this one, if it is on the sheet.
    pub fn offset(self, rows: usize, cols: usize) -> Result<Self> {
        let row = self.row.checked_add(rows).filter(|&r| r < MAX_ROWS);
        let col = self.col.checked_add(cols).filter(|&c| c < MAX_COLS);
        match (row, col) {
            (Some(row), Some(col)) => Ok(Self { row, col }),
            _ => Err(Error::Tool(format!(
                "range starting at {} runs off the sheet",
                self.to_a1()
            ))),
        }
    }

    pub fn to_a1(self) -> String {
        let mut letters = Vec::new();
        let mut n = self.col + 1;
        while n > 0 {
            letters.push(char::from(b'A' + ((n - 1) % 26) as u8));
            n = (n - 1) / 26;
        }
        let mut a1: String = letters.iter().rev().collect();
        a1.push_str(&(self.row + 1).to_string());
        a1
    }
}

/// Split an optional `Sheet!` or `'My Sheet'!` prefix off an address.
fn split_sheet(address: &str) -> (Option<&str>, &str) {
    match address.rsplit_once('!') {
        Some((sheet, rest)) => {
            let sheet = sheet.trim();
            let sheet = sheet
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .unwrap_or(sheet);
            (Some(sheet), rest)
        }
        None => (None, address),
    }
}

/// Parse `A1:C3` (either corner order) or a single cell into top-left and bottom-right.
fn parse_range(range: &str) -> Result<(CellRef, CellRef)> {
    let (a, b) = match range.split_once(':') {
        Some((a, b)) => (CellRef::parse(a)?, CellRef::parse(b)?),
        None => {
            let cell = CellRef::parse(range)?;
            (cell, cell)
        }
    };
    let top_left = CellRef {
        row: a.row.min(b.row),
        col: a.col.min(b.col),
    };
    let bottom_right = CellRef {
        row: a.row.max(b.row),
        col: a.col.max(b.col),
    };
    let cells = (bottom_right.row - top_left.row + 1).saturating_mul(bottom_right.col - top_left.col + 1);
    if cells > MAX_RANGE_CELLS {
        return Err(Error::Tool(format!(
            "range '{}' covers {} cells, more than {}",
            range, cells, MAX_RANGE_CELLS
        )));
    }
    Ok((top_left, bottom_right))
}

pub trait SpreadsheetStore: Send + Sync {
    /// New workbook with one empty sheet at `path`; fails if the file already exists.
    fn create_workbook(&self, path: &str) -> Result<String>;

    fn open_workbook(&self, path: &str) -> Result<String>;

    /// Sheet names in workbook order.
    fn list_worksheets(&self, handle: &str) -> Result<Vec<String>>;

    fn create_worksheet(&self, handle: &str, name: &str) -> Result<()>;

    /// `None` for a cell that was never written.
    fn read_cell(&self, handle: &str, cell: &str) -> Result<Option<String>>;

    /// Rows of the rectangle named by `range` (`A1:C3`), empty cells as `None`.
    fn read_range(&self, handle: &str, range: &str) -> Result<Vec<Vec<Option<String>>>>;

    /// Writing to a sheet that does not exist yet creates it.
    fn write_cell(&self, handle: &str, cell: &str, value: &str) -> Result<()>;

    /// Write a block of rows whose top-left corner is `start_cell`.
    fn write_range(&self, handle: &str, start_cell: &str, rows: &[Vec<String>]) -> Result<()>;

    fn save_workbook(&self, handle: &str) -> Result<()>;

    /// Forget the workbook without saving.
    fn close_workbook(&self, handle: &str) -> Result<()>;

    fn close_all(&self);
}

#[derive(Debug, Default)]
struct Sheet {
    rows: Vec<Vec<String>>,
}

impl Sheet {
    fn get(&self, at: CellRef) -> Option<&str> {
        self.rows
            .get(at.row)
            .and_then(|r| r.get(at.col))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn set(&mut self, at: CellRef, value: &str) {
        if self.rows.len() <= at.row {
            self.rows.resize_with(at.row + 1, Vec::new);
        }
        let row = &mut self.rows[at.row];
        if row.len() <= at.col {
            row.resize(at.col + 1, String::new());
        }
        row[at.col] = value.to_string();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Csv,
    Xlsx,
}

impl Format {
    fn of(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "csv" => Ok(Format::Csv),
            "xlsx" => Ok(Format::Xlsx),
            _ => Err(Error::Tool(format!(
                "unsupported workbook type '{}': use .xlsx or .csv",
                path.display()
            ))),
        }
    }
}

/// An open workbook. Always holds at least one sheet.
#[derive(Debug)]
struct Workbook {
    format: Format,
    sheets: Vec<(String, Sheet)>,
}

impl Workbook {
    fn new(format: Format) -> Self {
        Self {
            format,
            sheets: vec![(DEFAULT_SHEET.to_string(), Sheet::default())],
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.sheets.iter().position(|(n, _)| n == name)
    }

    fn sheet(&self, name: Option<&str>) -> Result<&Sheet> {
        let idx = match name {
            None => 0,
            Some(name) => self
                .position(name)
                .ok_or_else(|| Error::NotFound(format!("no worksheet named '{}'", name)))?,
        };
        Ok(&self.sheets[idx].1)
    }

    fn sheet_mut(&mut self, name: Option<&str>) -> Result<&mut Sheet> {
        let idx = match name {
            None => 0,
            Some(name) => match self.position(name) {
                Some(idx) => idx,
                None => {
                    self.add_sheet(name)?;
                    self.sheets.len() - 1
                }
            },
        };
        Ok(&mut self.sheets[idx].1)
    }

    fn add_sheet(&mut self, name: &str) -> Result<()> {
        if self.format == Format::Csv {
            return Err(Error::Tool("a CSV workbook holds a single sheet".into()));
        }
        if name.is_empty() || name.chars().count() > 31 || name.contains(['[', ']', ':', '*', '?', '/', '\\']) {
            return Err(Error::Tool(format!("invalid worksheet name '{}'", name)));
        }
        if self.sheets.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)) {
            return Err(Error::Tool(format!("worksheet '{}' already exists", name)));
        }
        self.sheets.push((name.to_string(), Sheet::default()));
        Ok(())
    }
}

/// File-backed workbooks, relative paths resolved against a base directory.
pub struct FileWorkbooks {
    base_dir: PathBuf,
    open: Mutex<HashMap<String, Workbook>>,
}

impl FileWorkbooks {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            open: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }

    fn with_book<T>(&self, handle: &str, f: impl FnOnce(&mut Workbook) -> Result<T>) -> Result<T> {
        let mut open = self
            .open
            .lock()
            .map_err(|_| Error::Other("workbook store poisoned".into()))?;
        let book = open
            .get_mut(handle)
            .ok_or_else(|| Error::NotFound(format!("workbook '{}' is not open", handle)))?;
        f(book)
    }

    fn insert(&self, handle: String, book: Workbook) -> Result<String> {
        self.open
            .lock()
            .map_err(|_| Error::Other("workbook store poisoned".into()))?
            .insert(handle.clone(), book);
        Ok(handle)
    }
}

fn read_csv(path: &Path) -> Result<Workbook> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| Error::Tool(format!("cannot read {}: {}", path.display(), e)))?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| Error::Tool(format!("bad CSV in {}: {}", path.display(), e)))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(Workbook {
        format: Format::Csv,
        sheets: vec![(DEFAULT_SHEET.to_string(), Sheet { rows })],
    })
}

fn write_csv(path: &Path, sheet: &Sheet) -> Result<()> {
    let width = sheet.rows.iter().map(Vec::len).max().unwrap_or(0);
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(|e| Error::Tool(format!("cannot write {}: {}", path.display(), e)))?;
    for row in &sheet.rows {
        let mut padded = row.clone();
        padded.resize(width, String::new());
        writer
            .write_record(&padded)
            .map_err(|e| Error::Tool(format!("cannot write {}: {}", path.display(), e)))?;
    }
    writer.flush()?;
    Ok(())
}

/// Whole floats print without a fractional part.
fn format_number(f: f64) -> String {
    if f == (f as i64) as f64 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

fn data_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => format_number(*f),
        Data::Int(i) => format!("{}", i),
        Data::Bool(b) => format!("{}", b),
        Data::DateTime(dt) => format!("{}", dt),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#ERR:{:?}", e),
    }
}

fn read_xlsx(path: &Path) -> Result<Workbook> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| Error::Tool(format!("cannot read {}: {}", path.display(), e)))?;
    let mut sheets = Vec::new();
    for name in workbook.sheet_names().to_vec() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| Error::Tool(format!("cannot read sheet '{}' of {}: {}", name, path.display(), e)))?;
        let mut sheet = Sheet::default();
        if let Some((top, left)) = range.start() {
            for (r, c, cell) in range.used_cells() {
                let text = data_text(cell);
                if !text.is_empty() {
                    sheet.set(
                        CellRef {
                            row: top as usize + r,
                            col: left as usize + c,
                        },
                        &text,
                    );
                }
            }
        }
        sheets.push((name, sheet));
    }
    if sheets.is_empty() {
        sheets.push((DEFAULT_SHEET.to_string(), Sheet::default()));
    }
    Ok(Workbook {
        format: Format::Xlsx,
        sheets,
    })
}

const SPREADSHEET_NS: &str = "http://schemas.openxmlformats.org/spreadsheetml/2006/main";
const RELATIONSHIPS_NS: &str = "http://schemas.openxmlformats.org/officeDocument/2006/relationships";
const PACKAGE_RELS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";

/// XML-escaped text with characters XML 1.0 cannot carry dropped.
fn xml_text(s: &str) -> String {
    let clean: String = s
        .chars()
        .filter(|&c| matches!(c, '\t' | '\n' | '\r') || c >= ' ')
        .collect();
    quick_xml::escape::escape(clean.as_str()).into_owned()
}

fn sheet_xml(sheet: &Sheet) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><worksheet xmlns="{}"><sheetData>"#,
        SPREADSHEET_NS
    );
    for (r, row) in sheet.rows.iter().enumerate() {
        if row.iter().all(String::is_empty) {
            continue;
        }
        xml.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            let at = CellRef { row: r, col: c }.to_a1();
            // Numbers that read back unchanged are stored as numbers.
            let numeric = value
                .parse::<f64>()
                .map(|f| f.is_finite() && format_number(f) == *value)
                .unwrap_or(false);
            if numeric {
                xml.push_str(&format!(r#"<c r="{}"><v>{}</v></c>"#, at, value));
            } else {
                xml.push_str(&format!(
                    r#"<c r="{}" t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                    at,
                    xml_text(value)
                ));
            }
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData></worksheet>");
    xml
}

fn xlsx_parts(book: &Workbook) -> Vec<(String, String)> {
    let n = book.sheets.len();
    let header = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;

    let mut content_types = format!(
        r#"{}<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>"#,
        header
    );
    for i in 1..=n {
        content_types.push_str(&format!(
            r#"<Override PartName="/xl/worksheets/sheet{}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#,
            i
        ));
    }
    content_types.push_str("</Types>");

    let root_rels = format!(
        r#"{}<Relationships xmlns="{}"><Relationship Id="rId1" Type="{}/officeDocument" Target="xl/workbook.xml"/></Relationships>"#,
        header, PACKAGE_RELS_NS, RELATIONSHIPS_NS
    );

    let mut workbook = format!(
        r#"{}<workbook xmlns="{}" xmlns:r="{}"><sheets>"#,
        header, SPREADSHEET_NS, RELATIONSHIPS_NS
    );
    let mut workbook_rels = format!(r#"{}<Relationships xmlns="{}">"#, header, PACKAGE_RELS_NS);
    for (i, (name, _)) in book.sheets.iter().enumerate() {
        let id = i + 1;
        workbook.push_str(&format!(
            r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
            xml_text(name),
            id,
            id
        ));
        workbook_rels.push_str(&format!(
            r#"<Relationship Id="rId{}" Type="{}/worksheet" Target="worksheets/sheet{}.xml"/>"#,
            id, RELATIONSHIPS_NS, id
        ));
    }
    workbook.push_str("</sheets></workbook>");
    workbook_rels.push_str("</Relationships>");

    let mut parts = vec![
        ("[Content_Types].xml".to_string(), content_types),
        ("_rels/.rels".to_string(), root_rels),
        ("xl/workbook.xml".to_string(), workbook),
        ("xl/_rels/workbook.xml.rels".to_string(), workbook_rels),
    ];
    for (i, (_, sheet)) in book.sheets.iter().enumerate() {
        parts.push((format!("xl/worksheets/sheet{}.xml", i + 1), sheet_xml(sheet)));
    }
    parts
}

fn write_xlsx(path: &Path, book: &Workbook) -> Result<()> {
    let file = std::fs::File::create(path)
        .map_err(|e| Error::Tool(format!("cannot write {}: {}", path.display(), e)))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, body) in xlsx_parts(book) {
        zip.start_file(name, options)
            .map_err(|e| Error::Tool(format!("Zip error: {}", e)))?;
        zip.write_all(body.as_bytes())?;
    }
    zip.finish()
        .map_err(|e| Error::Tool(format!("Zip finish error: {}", e)))?;
    Ok(())
}

impl SpreadsheetStore for FileWorkbooks {
    fn create_workbook(&self, path: &str) -> Result<String> {
        let full = self.resolve(path);
        let format = Format::of(&full)?;
        if full.exists() {
            return Err(Error::Tool(format!("{} already exists", full.display())));
        }
        info!(path = %full.display(), "Creating workbook");
        self.insert(full.display().to_string(), Workbook::new(format))
    }

    fn open_workbook(&self, path: &str) -> Result<String> {
        let full = self.resolve(path);
        let handle = full.display().to_string();
        if self
            .open
            .lock()
            .map(|open| open.contains_key(&handle))
            .unwrap_or(false)
        {
            return Ok(handle);
        }
        let book = match Format::of(&full)? {
            Format::Csv => read_csv(&full)?,
            Format::Xlsx => read_xlsx(&full)?,
        };
        debug!(path = %handle, sheets = book.sheets.len(), "Opened workbook");
        self.insert(handle, book)
    }

    fn list_worksheets(&self, handle: &str) -> Result<Vec<String>> {
        self.with_book(handle, |book| Ok(book.sheets.iter().map(|(n, _)| n.clone()).collect()))
    }

    fn create_worksheet(&self, handle: &str, name: &str) -> Result<()> {
        self.with_book(handle, |book| book.add_sheet(name.trim()))
    }

    fn read_cell(&self, handle: &str, cell: &str) -> Result<Option<String>> {
        let (sheet, cell) = split_sheet(cell);
        let at = CellRef::parse(cell)?;
        self.with_book(handle, |book| Ok(book.sheet(sheet)?.get(at).map(str::to_string)))
    }

    fn read_range(&self, handle: &str, range: &str) -> Result<Vec<Vec<Option<String>>>> {
        let (sheet, range) = split_sheet(range);
        let (top_left, bottom_right) = parse_range(range)?;
        self.with_book(handle, |book| {
            let sheet = book.sheet(sheet)?;
            Ok((top_left.row..=bottom_right.row)
                .map(|row| {
                    (top_left.col..=bottom_right.col)
                        .map(|col| sheet.get(CellRef { row, col }).map(str::to_string))
                        .collect()
                })
                .collect())
        })
    }

    fn write_cell(&self, handle: &str, cell: &str, value: &str) -> Result<()> {
        let (sheet, cell) = split_sheet(cell);
        let at = CellRef::parse(cell)?;
        self.with_book(handle, |book| {
            book.sheet_mut(sheet)?.set(at, value);
            Ok(())
        })
    }

    fn write_range(&self, handle: &str, start_cell: &str, rows: &[Vec<String>]) -> Result<()> {
        let (sheet, start_cell) = split_sheet(start_cell);
        let start = CellRef::parse(start_cell)?;
        let height = rows.len().saturating_sub(1);
        let width = rows.iter().map(Vec::len).max().unwrap_or(0).saturating_sub(1);
        start.offset(height, width)?;
        self.with_book(handle, |book| {
            let sheet = book.sheet_mut(sheet)?;
            for (dr, row) in rows.iter().enumerate() {
                for (dc, value) in row.iter().enumerate() {
                    sheet.set(start.offset(dr, dc)?, value);
                }
            }
            Ok(())
        })
    }

    fn save_workbook(&self, handle: &str) -> Result<()> {
        let path = Path::new(handle);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.with_book(handle, |book| match book.format {
            Format::Csv => write_csv(path, &book.sheets[0].1),
            Format::Xlsx => write_xlsx(path, book),
        })?;
        info!(path = handle, "Saved workbook");
        Ok(())
    }

    fn close_workbook(&self, handle: &str) -> Result<()> {
        self.open
            .lock()
            .map_err(|_| Error::Other("workbook store poisoned".into()))?
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("workbook '{}' is not open", handle)))
    }

    fn close_all(&self) {
        if let Ok(mut open) = self.open.lock() {
            open.clear();
        }
    }
}
