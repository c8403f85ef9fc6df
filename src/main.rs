fn main() {
    rld::linker_main();
}
