//! Mesh file export (PLY)
//!
//! Stanford Polygon File Format writer, ASCII and binary little-endian.
//! Specification: <http://paulbourke.net/dataformats/ply/>

use crate::error::Result;
use crate::mesh::Mesh;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Export a mesh to PLY with positions, normals and per-vertex colors
///
/// # Arguments
/// * `mesh` - Mesh to export
/// * `path` - Output file path
/// * `binary` - If true, write binary little-endian PLY; else ASCII
pub fn export_mesh_ply(mesh: &Mesh, path: impl AsRef<Path>, binary: bool) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer, "ply")?;
    if binary {
        writeln!(writer, "format binary_little_endian 1.0")?;
    } else {
        writeln!(writer, "format ascii 1.0")?;
    }
    writeln!(writer, "comment Exported from voxfuse")?;
    writeln!(writer, "element vertex {}", mesh.vertices.len())?;
    writeln!(writer, "property float x")?;
    writeln!(writer, "property float y")?;
    writeln!(writer, "property float z")?;
    writeln!(writer, "property float nx")?;
    writeln!(writer, "property float ny")?;
    writeln!(writer, "property float nz")?;
    writeln!(writer, "property uchar red")?;
    writeln!(writer, "property uchar green")?;
    writeln!(writer, "property uchar blue")?;
    writeln!(writer, "element face {}", mesh.num_triangles())?;
    writeln!(writer, "property list uchar int vertex_indices")?;
    writeln!(writer, "end_header")?;

    if binary {
        write_ply_binary(&mut writer, mesh)?;
    } else {
        write_ply_ascii(&mut writer, mesh)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_ply_ascii(writer: &mut BufWriter<File>, mesh: &Mesh) -> Result<()> {
    for ((position, normal), color) in mesh
        .vertices
        .iter()
        .zip(&mesh.normals)
        .zip(&mesh.colors)
    {
        writeln!(
            writer,
            "{} {} {} {} {} {} {} {} {}",
            position.x,
            position.y,
            position.z,
            normal.x,
            normal.y,
            normal.z,
            color.r,
            color.g,
            color.b
        )?;
    }
    for triangle in mesh.indices.chunks(3) {
        writeln!(writer, "3 {} {} {}", triangle[0], triangle[1], triangle[2])?;
    }
    Ok(())
}

fn write_ply_binary(writer: &mut BufWriter<File>, mesh: &Mesh) -> Result<()> {
    for ((position, normal), color) in mesh
        .vertices
        .iter()
        .zip(&mesh.normals)
        .zip(&mesh.colors)
    {
        for value in [
            position.x, position.y, position.z, normal.x, normal.y, normal.z,
        ] {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.write_all(&[color.r, color.g, color.b])?;
    }
    for triangle in mesh.indices.chunks(3) {
        writer.write_all(&[3u8])?;
        for &index in triangle {
            writer.write_all(&(index as i32).to_le_bytes())?;
        }
    }
    Ok(())
}
