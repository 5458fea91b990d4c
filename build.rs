/// dist_gfx 构建脚本
///
/// 着色器字节码离线编译（glslangValidator / fxc），运行时按清单加载；
/// 这里只让源码与清单的改动触发重新构建。
fn main() {
    println!("cargo:rerun-if-changed=assets/shaders");
    println!("cargo:rerun-if-changed=build.rs");
}
