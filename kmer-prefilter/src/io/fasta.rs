use anyhow::Result;
use std::io::BufRead;

/// 一条 FASTA 记录。序列保留原始字母（转为大写），编码交给打分矩阵。
#[derive(Debug, Clone)]
pub struct FastaRecord {
    pub id: String,
    pub desc: Option<String>,
    pub seq: Vec<u8>,
}

/// 逐条读取 FASTA：
/// - 忽略首条记录前的空行与 `;` 注释行
/// - 序列行中的空白被丢弃，蛋白序列末尾的终止符 `*` 被去掉
pub struct FastaReader<R: BufRead> {
    reader: R,
    buf: String,
    peek_header: Option<String>,
    done: bool,
}

impl<R: BufRead> FastaReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, buf: String::new(), peek_header: None, done: false }
    }

    fn read_line(&mut self) -> Result<bool> {
        self.buf.clear();
        Ok(self.reader.read_line(&mut self.buf)? != 0)
    }

    pub fn next_record(&mut self) -> Result<Option<FastaRecord>> {
        if self.done {
            return Ok(None);
        }

        let header = match self.peek_header.take() {
            Some(h) => h,
            None => loop {
                if !self.read_line()? {
                    self.done = true;
                    return Ok(None);
                }
                if let Some(h) = self.buf.strip_prefix('>') {
                    break h.trim().to_string();
                }
            },
        };

        let mut parts = header.splitn(2, char::is_whitespace);
        let id = parts.next().unwrap_or("").to_string();
        let desc = parts.next().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

        let mut seq = Vec::new();
        loop {
            if !self.read_line()? {
                self.done = true;
                break;
            }
            if let Some(h) = self.buf.strip_prefix('>') {
                self.peek_header = Some(h.trim().to_string());
                break;
            }
            if self.buf.starts_with(';') {
                continue;
            }
            seq.extend(
                self.buf
                    .bytes()
                    .filter(|b| !b.is_ascii_whitespace())
                    .map(|b| b.to_ascii_uppercase()),
            );
        }
        if seq.last() == Some(&b'*') {
            seq.pop();
        }

        Ok(Some(FastaRecord { id, desc, seq }))
    }

    pub fn read_all(mut self) -> Result<Vec<FastaRecord>> {
        let mut out = Vec::new();
        while let Some(r) = self.next_record()? {
            out.push(r);
        }
        Ok(out)
    }
}
