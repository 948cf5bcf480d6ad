//! 名前付きの列データ（点群・ラベル）と、CSV・NPZ・MAT・VTK・Tecplot の読み書き。

use crate::error::{PinnError, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::{Array1, ArrayD};
use ndarray_npy::{NpzReader, NpzWriter, ReadNpzError};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use vtkio::model::{Attribute, Attributes, DataSet, IOBuffer, Piece};

/// 同じ長さを持つ名前付き `f32` 列の集合。
///
/// ジオメトリから標本化した座標、ラベル、法線ベクトルなどをまとめて保持します。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointSet {
    columns: BTreeMap<String, Vec<f32>>,
    len: usize,
}

impl PointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 行ごとの値から点群を作ります。各行の長さは `keys` と一致する必要があります。
    pub fn from_rows(keys: &[String], rows: &[Vec<f64>]) -> Result<Self> {
        let mut columns: Vec<Vec<f32>> = vec![Vec::with_capacity(rows.len()); keys.len()];
        for (i, row) in rows.iter().enumerate() {
            if row.len() != keys.len() {
                return Err(PinnError::Shape(format!(
                    "{} 行目の要素数 {} が列数 {} と一致しません",
                    i,
                    row.len(),
                    keys.len()
                )));
            }
            for (col, v) in columns.iter_mut().zip(row) {
                col.push(*v as f32);
            }
        }
        let mut set = Self::new();
        for (key, col) in keys.iter().zip(columns) {
            set.insert(key.clone(), col)?;
        }
        Ok(set)
    }

    /// 列を追加（または置き換え）します。
    pub fn insert(&mut self, key: impl Into<String>, values: Vec<f32>) -> Result<()> {
        let key = key.into();
        let replacing_only = self.columns.len() == 1 && self.columns.contains_key(&key);
        if !self.columns.is_empty() && !replacing_only && values.len() != self.len {
            return Err(PinnError::Shape(format!(
                "列 '{}' の長さ {} が点数 {} と一致しません",
                key,
                values.len(),
                self.len
            )));
        }
        self.len = values.len();
        self.columns.insert(key, values);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&[f32]> {
        self.columns
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| PinnError::UnknownField(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.columns.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.columns.keys()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 指定した行だけを取り出した点群。
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len) {
            return Err(PinnError::Shape(format!(
                "行番号 {} が点数 {} を超えています",
                bad, self.len
            )));
        }
        let columns = self
            .columns
            .iter()
            .map(|(k, col)| (k.clone(), indices.iter().map(|&i| col[i]).collect()))
            .collect();
        Ok(Self {
            columns,
            len: indices.len(),
        })
    }

    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.len {
            return Err(PinnError::Shape(format!(
                "範囲 {:?} が点数 {} の外にあります",
                range, self.len
            )));
        }
        let columns = self
            .columns
            .iter()
            .map(|(k, col)| (k.clone(), col[range.clone()].to_vec()))
            .collect();
        Ok(Self {
            columns,
            len: range.end - range.start,
        })
    }

    /// `other` の行を末尾に連結します。列名の集合が一致する必要があります。
    pub fn append(&mut self, other: &PointSet) -> Result<()> {
        if self.columns.is_empty() {
            *self = other.clone();
            return Ok(());
        }
        if !self.columns.keys().eq(other.columns.keys()) {
            return Err(PinnError::Shape(format!(
                "列名が一致しません: {:?} と {:?}",
                self.columns.keys().collect::<Vec<_>>(),
                other.columns.keys().collect::<Vec<_>>()
            )));
        }
        for (key, col) in self.columns.iter_mut() {
            col.extend_from_slice(&other.columns[key]);
        }
        self.len += other.len;
        Ok(())
    }

    /// 列 `key` を `[N, 1]` のテンソルとして返します。
    pub fn column_tensor<B: Backend>(&self, key: &str, device: &B::Device) -> Result<Tensor<B, 2>> {
        let col = self.get(key)?;
        Ok(Tensor::from_data(
            TensorData::new(col.to_vec(), [col.len(), 1]),
            device,
        ))
    }
}

/// CSV ファイルを読み込みます。
///
/// 1行目はヘッダとして列名に使います。`keys` を指定するとその列だけを取り出し、
/// `alias` で列名を付け替えます（例: `"Time" -> "t"`）。
pub fn load_csv_file(
    path: impl AsRef<Path>,
    keys: Option<&[&str]>,
    alias: &BTreeMap<String, String>,
) -> Result<PointSet> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .map_err(|e| PinnError::Data(format!("'{}' を読み込めません: {}", path.display(), e)))?;
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

    let (_, header) = lines
        .next()
        .ok_or_else(|| PinnError::Data(format!("'{}' が空です", path.display())))?;
    let names: Vec<String> = header.split(',').map(|s| s.trim().to_string()).collect();

    let wanted: Vec<usize> = match keys {
        Some(keys) => keys
            .iter()
            .map(|k| {
                names.iter().position(|n| n == k).ok_or_else(|| {
                    PinnError::Data(format!("'{}' に列 '{}' がありません", path.display(), k))
                })
            })
            .collect::<Result<_>>()?,
        None => (0..names.len()).collect(),
    };

    let mut columns: Vec<Vec<f32>> = vec![Vec::new(); wanted.len()];
    for (lineno, line) in lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != names.len() {
            return Err(PinnError::Data(format!(
                "{}:{}: 列数 {} がヘッダの列数 {} と一致しません",
                path.display(),
                lineno + 1,
                fields.len(),
                names.len()
            )));
        }
        for (col, &idx) in columns.iter_mut().zip(&wanted) {
            let v: f32 = fields[idx].parse().map_err(|_| {
                PinnError::Data(format!(
                    "{}:{}: '{}' を数値として解釈できません",
                    path.display(),
                    lineno + 1,
                    fields[idx]
                ))
            })?;
            col.push(v);
        }
    }

    let mut set = PointSet::new();
    for (col, &idx) in columns.into_iter().zip(&wanted) {
        let name = alias.get(&names[idx]).unwrap_or(&names[idx]).clone();
        set.insert(name, col)?;
    }
    Ok(set)
}

fn read_err(path: &Path, e: impl std::fmt::Display) -> PinnError {
    PinnError::Data(format!("'{}' を読み込めません: {}", path.display(), e))
}

fn is_wanted(keys: Option<&[&str]>, name: &str) -> bool {
    keys.is_none_or(|keys| keys.contains(&name))
}

/// 読み込んだ配列から `keys` の列を順に取り出し、`alias` で名前を付け替えます。
///
/// `keys` が `None` のときは全ての配列を使います。配列の長さはすべて一致する必要があります。
fn pick_columns(
    path: &Path,
    arrays: Vec<(String, Vec<f32>)>,
    keys: Option<&[&str]>,
    alias: &BTreeMap<String, String>,
) -> Result<PointSet> {
    let mut arrays: BTreeMap<String, Vec<f32>> = arrays.into_iter().collect();
    let order: Vec<String> = match keys {
        Some(keys) => keys.iter().map(|k| k.to_string()).collect(),
        None => arrays.keys().cloned().collect(),
    };
    let mut set = PointSet::new();
    for key in order {
        let values = arrays.remove(&key).ok_or_else(|| {
            PinnError::Data(format!("'{}' に配列 '{}' がありません", path.display(), key))
        })?;
        let name = alias.get(&key).unwrap_or(&key).clone();
        set.insert(name, values)?;
    }
    Ok(set)
}

/// NumPy の `.npz` ファイルを読み込みます。
///
/// 各配列を平坦化して1列とします。`f64` と `f32` の配列に対応します。
pub fn load_npz_file(
    path: impl AsRef<Path>,
    keys: Option<&[&str]>,
    alias: &BTreeMap<String, String>,
) -> Result<PointSet> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| read_err(path, e))?;
    let mut npz = NpzReader::new(file).map_err(|e| read_err(path, e))?;
    let names = npz.names().map_err(|e| read_err(path, e))?;
    let mut arrays = Vec::with_capacity(names.len());
    for raw in names {
        let key = raw.strip_suffix(".npy").unwrap_or(&raw).to_string();
        if !is_wanted(keys, &key) {
            continue;
        }
        let values = read_npz_array(&mut npz, &raw).map_err(|e| read_err(path, e))?;
        arrays.push((key, values));
    }
    pick_columns(path, arrays, keys, alias)
}

fn read_npz_array<R: Read + Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
) -> std::result::Result<Vec<f32>, ReadNpzError> {
    let doubles: std::result::Result<ArrayD<f64>, _> = npz.by_name(name);
    match doubles {
        Ok(array) => Ok(array.iter().map(|&v| v as f32).collect()),
        Err(_) => {
            let array: ArrayD<f32> = npz.by_name(name)?;
            Ok(array.iter().copied().collect())
        }
    }
}

/// 点群の各列を1次元 `f32` 配列として `.npz` に保存します。
pub fn save_npz_file(path: impl AsRef<Path>, data: &PointSet) -> Result<()> {
    let path = path.as_ref();
    create_parent(path)?;
    let write_err = |e: ndarray_npy::WriteNpzError| {
        PinnError::Data(format!("'{}' に書き込めません: {}", path.display(), e))
    };
    let mut npz = NpzWriter::new(File::create(path)?);
    for key in data.keys() {
        let array = Array1::from(data.get(key)?.to_vec());
        npz.add_array(key.as_str(), &array).map_err(write_err)?;
    }
    npz.finish().map_err(write_err)?;
    Ok(())
}

/// MATLAB の `.mat` (Level 5) ファイルを読み込みます。
///
/// 各数値配列を列優先のまま平坦化して1列とします。複素数の虚部は無視します。
pub fn load_mat_file(
    path: impl AsRef<Path>,
    keys: Option<&[&str]>,
    alias: &BTreeMap<String, String>,
) -> Result<PointSet> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| read_err(path, e))?;
    let mat = matfile::MatFile::parse(BufReader::new(file))
        .map_err(|e| read_err(path, format!("{e:?}")))?;
    let arrays = mat
        .arrays()
        .iter()
        .filter(|a| is_wanted(keys, a.name()))
        .map(|a| Ok((a.name().to_string(), mat_values(path, a)?)))
        .collect::<Result<Vec<_>>>()?;
    pick_columns(path, arrays, keys, alias)
}

fn mat_values(path: &Path, array: &matfile::Array) -> Result<Vec<f32>> {
    use matfile::NumericData as N;
    fn cast<T: Copy + Into<f64>>(v: &[T]) -> Vec<f32> {
        v.iter().map(|&x| x.into() as f32).collect()
    }
    let values = match array.data() {
        N::Double { real, .. } => cast(real),
        N::Single { real, .. } => real.clone(),
        N::Int8 { real, .. } => cast(real),
        N::UInt8 { real, .. } => cast(real),
        N::Int16 { real, .. } => cast(real),
        N::UInt16 { real, .. } => cast(real),
        N::Int32 { real, .. } => cast(real),
        N::UInt32 { real, .. } => cast(real),
        N::Int64 { real, .. } => real.iter().map(|&x| x as f32).collect(),
        N::UInt64 { real, .. } => real.iter().map(|&x| x as f32).collect(),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(PinnError::Data(format!(
                "'{}' の配列 '{}' は数値配列ではありません",
                path.display(),
                array.name()
            )));
        }
    };
    Ok(values)
}

/// VTK ファイル（レガシー形式または XML 形式）の点データを読み込みます。
///
/// 点の座標を `x`, `y`, `z` 列に、点データの各配列をその名前の列にします。
/// 多成分の配列は `<名前>_<成分番号>` に分けます。複数の piece は行方向に連結します。
pub fn load_vtk_file(
    path: impl AsRef<Path>,
    keys: Option<&[&str]>,
    alias: &BTreeMap<String, String>,
) -> Result<PointSet> {
    let path = path.as_ref();
    let vtk = vtkio::Vtk::import(path).map_err(|e| read_err(path, e))?;
    let pieces: Vec<(IOBuffer, Attributes)> = match vtk.data {
        DataSet::UnstructuredGrid { pieces, .. } => pieces
            .into_iter()
            .map(|p| inline_piece(path, p).map(|p| (p.points, p.data)))
            .collect::<Result<_>>()?,
        DataSet::PolyData { pieces, .. } => pieces
            .into_iter()
            .map(|p| inline_piece(path, p).map(|p| (p.points, p.data)))
            .collect::<Result<_>>()?,
        _ => {
            return Err(PinnError::Data(format!(
                "'{}': 非構造格子とポリデータ以外の VTK データセットには対応していません",
                path.display()
            )));
        }
    };

    let mut merged = PointSet::new();
    for (points, data) in pieces {
        merged.append(&vtk_piece_columns(path, points, data)?)?;
    }
    let arrays = merged
        .columns
        .into_iter()
        .filter(|(k, _)| is_wanted(keys, k))
        .collect();
    pick_columns(path, arrays, keys, alias)
}

fn inline_piece<P>(path: &Path, piece: Piece<P>) -> Result<P> {
    match piece {
        Piece::Inline(p) => Ok(*p),
        _ => Err(PinnError::Data(format!(
            "'{}': 外部ファイルを参照する piece には対応していません",
            path.display()
        ))),
    }
}

fn vtk_piece_columns(path: &Path, points: IOBuffer, data: Attributes) -> Result<PointSet> {
    let coords = buffer_values(path, "points", points)?;
    if coords.len() % 3 != 0 {
        return Err(PinnError::Data(format!(
            "'{}': 座標の要素数 {} が3の倍数ではありません",
            path.display(),
            coords.len()
        )));
    }
    let n = coords.len() / 3;
    let mut set = PointSet::new();
    for (axis, name) in ["x", "y", "z"].iter().enumerate() {
        set.insert(*name, coords.iter().skip(axis).step_by(3).copied().collect())?;
    }

    let mut arrays: Vec<(String, IOBuffer)> = Vec::new();
    for attr in data.point {
        match attr {
            Attribute::DataArray(array) => arrays.push((array.name, array.data)),
            Attribute::Field { data_array, .. } => {
                arrays.extend(data_array.into_iter().map(|f| (f.name, f.data)));
            }
        }
    }
    for (name, buffer) in arrays {
        let values = buffer_values(path, &name, buffer)?;
        if n == 0 || values.len() % n != 0 {
            return Err(PinnError::Data(format!(
                "'{}': 点データ '{}' の要素数 {} が点数 {} の倍数ではありません",
                path.display(),
                name,
                values.len(),
                n
            )));
        }
        let comps = values.len() / n;
        if comps == 1 {
            set.insert(name, values)?;
        } else {
            for c in 0..comps {
                let col = values.iter().skip(c).step_by(comps).copied().collect();
                set.insert(format!("{name}_{c}"), col)?;
            }
        }
    }
    Ok(set)
}

fn buffer_values(path: &Path, name: &str, buffer: IOBuffer) -> Result<Vec<f32>> {
    let values = buffer.cast_into::<f64>().ok_or_else(|| {
        PinnError::Data(format!(
            "'{}': 配列 '{}' を数値に変換できません",
            path.display(),
            name
        ))
    })?;
    Ok(values.into_iter().map(|x| x as f32).collect())
}

/// 時系列の VTK ファイル群を読み込み、時刻列 `t` を付けて行方向に連結します。
///
/// `files[i]` は時刻 `times[i]` のスナップショットです。
pub fn load_vtk_with_time_file<P: AsRef<Path>>(
    files: &[P],
    times: &[f64],
    keys: Option<&[&str]>,
    alias: &BTreeMap<String, String>,
) -> Result<PointSet> {
    if files.len() != times.len() {
        return Err(PinnError::Data(format!(
            "ファイル数 {} と時刻数 {} が一致しません",
            files.len(),
            times.len()
        )));
    }
    let mut merged = PointSet::new();
    for (file, &t) in files.iter().zip(times) {
        let mut snapshot = load_vtk_file(file, keys, alias)?;
        snapshot.insert("t", vec![t as f32; snapshot.len()])?;
        merged.append(&snapshot)?;
    }
    Ok(merged)
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// 点群を Tecplot の ASCII (POINT 形式) で保存し、書き出したパスを返します。
///
/// 点群は `num_timestamps` 個の同じ大きさのブロックに分かれているものとし、
/// 各ブロックを `I = num_x, J = num_y` のゾーンとして書き出します。
/// 時刻が2つ以上あるときはブロックごとに `<stem>_t-<k>.dat` を作ります。
pub fn save_tecplot_file(
    path: impl AsRef<Path>,
    data: &PointSet,
    keys: &[&str],
    num_x: usize,
    num_y: usize,
    num_timestamps: usize,
) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    let block = num_x * num_y;
    if block == 0 || num_timestamps == 0 || block * num_timestamps != data.len() {
        return Err(PinnError::Shape(format!(
            "点数 {} が {} x {} x {} (num_x x num_y x 時刻数) と一致しません",
            data.len(),
            num_x,
            num_y,
            num_timestamps
        )));
    }
    let columns: Vec<&[f32]> = keys.iter().map(|k| data.get(k)).collect::<Result<_>>()?;
    create_parent(path)?;

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("tecplot");
    let mut written = Vec::with_capacity(num_timestamps);
    for t in 0..num_timestamps {
        let file = if num_timestamps == 1 {
            path.to_path_buf()
        } else {
            path.with_file_name(format!("{stem}_t-{t}.dat"))
        };
        let mut w = BufWriter::new(File::create(&file)?);
        writeln!(w, "title = \"{stem}\"")?;
        let vars: Vec<String> = keys.iter().map(|k| format!("\"{k}\"")).collect();
        writeln!(w, "variables = {}", vars.join(", "))?;
        writeln!(w, "Zone I = {num_x}, J = {num_y}, F = POINT")?;
        for i in t * block..(t + 1) * block {
            let row: Vec<String> = columns.iter().map(|c| format!("{:.8}", c[i])).collect();
            writeln!(w, "{}", row.join(" "))?;
        }
        w.flush()?;
        written.push(file);
    }
    tracing::debug!("Tecplot ファイルを保存しました: {}", path.display());
    Ok(written)
}

/// 点群を CSV として保存します。
pub fn save_csv_file(path: impl AsRef<Path>, data: &PointSet, delimiter: char) -> Result<()> {
    let path = path.as_ref();
    create_parent(path)?;
    let keys: Vec<&String> = data.keys().collect();
    let columns: Vec<&[f32]> = keys
        .iter()
        .map(|k| data.get(k))
        .collect::<Result<_>>()?;

    let mut w = BufWriter::new(File::create(path)?);
    let sep = delimiter.to_string();
    writeln!(
        w,
        "{}",
        keys.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(&sep)
    )?;
    for i in 0..data.len() {
        let row: Vec<String> = columns.iter().map(|c| format!("{:.8}", c[i])).collect();
        writeln!(w, "{}", row.join(&sep))?;
    }
    w.flush()?;
    tracing::debug!("CSV を保存しました: {}", path.display());
    Ok(())
}
