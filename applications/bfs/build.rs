fn main() {
    build_support::compile_descriptor("descriptor.json", "bfs");
}
